//! Emits job lifecycle events onto the stream bus.

use std::sync::Arc;

use tracing::{debug, warn};

use super::events::JobEvent;
use crate::kernel::bus::StreamBus;
use crate::kernel::stream_hub::SseMessage;

/// Turns [`JobEvent`]s into SSE frames and publishes them.
///
/// Delivery is best-effort: a bus failure is logged, never surfaced to the
/// job runtime. Clients that miss a frame learn the truth from the job row.
#[derive(Clone)]
pub struct JobNotifier {
    bus: Arc<dyn StreamBus>,
}

impl JobNotifier {
    pub fn new(bus: Arc<dyn StreamBus>) -> Self {
        Self { bus }
    }

    pub async fn notify(&self, event: JobEvent) {
        let Some(user_id) = event.owner_user_id() else {
            // System jobs have no stream to land on.
            debug!(job_id = %event.job_id(), kind = event.kind(), "skipping sse for ownerless job");
            return;
        };

        let msg = SseMessage::new(user_id, event.kind(), event.payload());
        if let Err(e) = self.bus.publish(msg).await {
            warn!(job_id = %event.job_id(), kind = event.kind(), error = %e, "failed to publish job event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::bus::TestStreamBus;
    use crate::kernel::jobs::job::Job;
    use uuid::Uuid;

    #[tokio::test]
    async fn notify_publishes_owned_events() {
        let bus = Arc::new(TestStreamBus::new());
        let notifier = JobNotifier::new(bus.clone());

        let job = Job::immediate(Uuid::new_v4(), "demo");
        notifier.notify(JobEvent::Queued { job }).await;

        assert!(bus.was_published("job.queued"));
    }

    #[tokio::test]
    async fn notify_skips_system_jobs() {
        let bus = Arc::new(TestStreamBus::new());
        let notifier = JobNotifier::new(bus.clone());

        let job = Job::builder().job_type("cleanup".to_string()).build();
        notifier.notify(JobEvent::Queued { job }).await;

        assert_eq!(bus.publish_count(), 0);
    }
}
