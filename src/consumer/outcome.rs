//! Mapping from handler outcomes to wire decisions.

/// What should happen to a delivered message once its handler has settled.
///
/// Each variant maps 1:1 to a wire call: `Ack` → `basic.ack`, `Requeue` →
/// `basic.nack(requeue=true)`, `Drop` → `basic.nack(requeue=false)` (the
/// message goes to the dead-letter exchange if one is configured).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerStatus {
    Ack,
    Requeue,
    Drop,
}

/// The pure decision function, evaluated exactly once per delivered message
/// after its handler settles.
///
/// A handler that returns no status is treated as a plain success and the
/// message is acked. A handler that fails gets its message requeued, unless
/// requeue-on-error is disabled, in which case the message is dropped.
pub(crate) fn decide(
    outcome: &Result<Option<ConsumerStatus>, anyhow::Error>,
    requeue_on_error: bool,
) -> ConsumerStatus {
    match outcome {
        Ok(Some(status)) => *status,
        Ok(None) => ConsumerStatus::Ack,
        Err(_) if requeue_on_error => ConsumerStatus::Requeue,
        Err(_) => ConsumerStatus::Drop,
    }
}
