use crate::error::SchedulingResult;

/// Boundary to the billing/subscription collaborator. The generator asks it
/// for remaining credits before materializing sessions; lifecycle operations
/// signal consumption on completion and hand credits back on cancellation.
pub trait SubscriptionGateway: Send + Sync {
    /// Remaining session credits, or `None` when the plan is unlimited.
    fn sessions_remaining(
        &self,
        subscription_id: i64,
    ) -> impl std::future::Future<Output = SchedulingResult<Option<u32>>> + Send;

    fn consume_credit(
        &self,
        subscription_id: i64,
        session_id: i64,
    ) -> impl std::future::Future<Output = SchedulingResult<()>> + Send;

    fn return_credit(
        &self,
        subscription_id: i64,
        session_id: i64,
    ) -> impl std::future::Future<Output = SchedulingResult<()>> + Send;
}

/// Gateway for circles that do not bill per session. Never limits generation
/// and swallows the consumption signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedSubscriptions;

impl SubscriptionGateway for UnlimitedSubscriptions {
    async fn sessions_remaining(&self, _subscription_id: i64) -> SchedulingResult<Option<u32>> {
        Ok(None)
    }

    async fn consume_credit(
        &self,
        _subscription_id: i64,
        _session_id: i64,
    ) -> SchedulingResult<()> {
        Ok(())
    }

    async fn return_credit(
        &self,
        _subscription_id: i64,
        _session_id: i64,
    ) -> SchedulingResult<()> {
        Ok(())
    }
}
