//! The bounded MPMC job queue between the scheduler and the worker pool.

use crate::api::JobDescriptor;

/// Depth of the job queue. The look-ahead cap is the primary backpressure
/// mechanism; this bound is the hard stop behind it.
pub(crate) const JOB_QUEUE_DEPTH: usize = 1024;

/// An item on the job queue: work, or a shutdown sentinel. The supervisor
/// enqueues exactly one sentinel per worker task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueueItem {
    Job(JobDescriptor),
    Stop,
}

pub(crate) fn job_queue() -> (
    async_channel::Sender<QueueItem>,
    async_channel::Receiver<QueueItem>,
) {
    async_channel::bounded(JOB_QUEUE_DEPTH)
}
