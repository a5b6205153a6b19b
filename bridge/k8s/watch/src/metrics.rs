use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family};
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct EventLabels {
    kind: String,
    op: String,
}

/// Counters shared by every watch runtime in the process.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    events: Family<EventLabels, Counter>,
    requeues: Family<KindLabels, Counter>,
    drops: Family<KindLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: String,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let events = Family::<EventLabels, Counter>::default();
        reg.register(
            "events",
            "Total watch events observed, by resource kind and operation",
            events.clone(),
        );

        let requeues = Family::<KindLabels, Counter>::default();
        reg.register(
            "requeues",
            "Total failed handler invocations requeued with back-off",
            requeues.clone(),
        );

        let drops = Family::<KindLabels, Counter>::default();
        reg.register(
            "drops",
            "Total items dropped after exhausting their retry budget",
            drops.clone(),
        );

        Self {
            events,
            requeues,
            drops,
        }
    }

    pub(crate) fn incr_event(&self, kind: &str, op: &'static str) {
        self.events
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
                op: op.to_string(),
            })
            .inc();
    }

    pub(crate) fn incr_requeue(&self, kind: &str) {
        self.requeues
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub(crate) fn incr_drop(&self, kind: &str) {
        self.drops
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}
