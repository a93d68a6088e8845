//! Bounded retry combinator.
//!
//! Every polling loop in the driver (FIFO waits, status polls, link resync)
//! goes through `retry_with_limit`, so the bound is explicit and testable.

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Finished with a value.
    Done(T),
    /// Not yet; try again if the limit allows.
    Retry,
}

/// Run `attempt` until it returns `Done`, at most `limit` times.
///
/// The closure receives the zero-based attempt index. Errors abort
/// immediately; exhausting the limit yields `Ok(None)` so callers can map it
/// to their own timeout error.
pub fn retry_with_limit<T, E>(
    limit: usize,
    mut attempt: impl FnMut(usize) -> Result<Attempt<T>, E>,
) -> Result<Option<T>, E> {
    for index in 0..limit {
        if let Attempt::Done(value) = attempt(index)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockPort, ParallelPort, PortError, PortRegister};

    #[test]
    fn test_retry_returns_first_done() {
        let result: Result<Option<usize>, ()> =
            retry_with_limit(10, |i| Ok(if i == 3 { Attempt::Done(i) } else { Attempt::Retry }));
        assert_eq!(result, Ok(Some(3)));
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut calls = 0;
        let result: Result<Option<()>, ()> = retry_with_limit(5, |_| {
            calls += 1;
            Ok(Attempt::Retry)
        });
        assert_eq!(result, Ok(None));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_retry_propagates_port_fault() {
        let mut port = MockPort::new();
        port.fail_after(4);
        let mut polls = 0;
        let result = retry_with_limit(100, |_| -> Result<Attempt<u8>, PortError> {
            polls += 1;
            port.inb(PortRegister::Status)?;
            Ok(Attempt::Retry)
        });
        assert!(matches!(result, Err(PortError::InjectedFault { .. })));
        assert_eq!(polls, 5);
    }
}
