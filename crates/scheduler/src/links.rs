//! Link recorder: routes each non-tail call to the continuation that consumes its result.

use crate::error::ScheduleWarning;
use callflow_ir::{Link, NodeId};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct LinkRecorder {
    links: BTreeMap<NodeId, Link>,
    warnings: Vec<ScheduleWarning>,
}

impl LinkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins. Recording the same call twice is reported, never fatal.
    pub fn record_link(&mut self, link: Link) -> Option<Link> {
        let call = link.call;
        let previous = self.links.insert(call, link);
        if previous.is_some() {
            warn!(call = %call, "link recorded twice; keeping the latest");
            self.warnings.push(ScheduleWarning::DuplicateLink { call });
        }
        previous
    }

    pub fn get(&self, call: NodeId) -> Option<&Link> {
        self.links.get(&call)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn warnings(&self) -> &[ScheduleWarning] {
        &self.warnings
    }

    pub fn into_parts(self) -> (BTreeMap<NodeId, Link>, Vec<ScheduleWarning>) {
        (self.links, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_ir::{SubgraphId, TensorId};

    fn link(call: usize, continuation: usize) -> Link {
        Link {
            call: NodeId(call),
            continuation: SubgraphId(continuation),
            consumer: NodeId(call + 100),
            tensors: vec![TensorId(call)],
        }
    }

    #[test]
    fn repeat_record_keeps_latest_and_warns() {
        let mut recorder = LinkRecorder::new();
        assert!(recorder.record_link(link(4, 1)).is_none());
        let previous = recorder.record_link(link(4, 2));

        assert_eq!(previous.map(|l| l.continuation), Some(SubgraphId(1)));
        assert_eq!(recorder.len(), 1);
        assert_eq!(
            recorder.get(NodeId(4)).map(|l| l.continuation),
            Some(SubgraphId(2))
        );
        assert_eq!(
            recorder.warnings(),
            &[ScheduleWarning::DuplicateLink { call: NodeId(4) }]
        );
    }

    #[test]
    fn distinct_calls_do_not_warn() {
        let mut recorder = LinkRecorder::new();
        recorder.record_link(link(1, 1));
        recorder.record_link(link(2, 1));
        assert_eq!(recorder.len(), 2);
        assert!(recorder.warnings().is_empty());
    }
}
