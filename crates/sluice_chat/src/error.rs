use thiserror::Error;

/// A Secure Chat contract breach surfaced to the connection supervisor.
///
/// The queue keeps accepting tasks after reporting one of these; whether the
/// player session is torn down is the supervisor's call. The offending task
/// itself completes as a no-op.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum ChatViolation {
    /// The client's last-seen offset plus the withheld acknowledgements left
    /// the VarInt domain. The outbound packet was clamped to the maximum.
    #[error("last-seen offset {offset} + {delta} withheld acks exceeds the protocol maximum")]
    AckOffsetOverflow { offset: i32, delta: i32 },

    /// The client sent an acknowledgement packet with a negative count.
    #[error("received negative acknowledgement count {count}")]
    NegativeAckCount { count: i32 },

    /// The withheld-acknowledgement accumulator went negative. This is an
    /// internal bookkeeping failure, not client input.
    #[error("delayed acknowledgement count underflowed to {count} in {task} task")]
    DelayedAckUnderflow { count: i32, task: &'static str },
}

impl ChatViolation {
    /// Whether this violation indicates corrupted internal bookkeeping
    /// rather than malformed client input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DelayedAckUnderflow { .. })
    }
}
