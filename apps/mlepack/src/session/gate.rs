//! Async wrapper around the core gate state machine.

use mlepack_core::{GateEvent, GateState, MleError, transition};
use serde_json::Value;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

/// What the gate reports for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Another operation is pending; this one was not started.
    Busy,
    Success { status: String, data: Value },
    Failure(String),
}

/// Serialises a session's operations. Never fails itself.
#[derive(Debug)]
pub struct Gate {
    session: u64,
    state: Mutex<GateState>,
}

impl Gate {
    #[must_use]
    pub fn new(session: u64) -> Self {
        Self {
            session,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn state(&self) -> GateState {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(&self, state: &mut GateState, event: GateEvent) {
        if let Some(next) = transition(*state, event) {
            *state = next;
            tracing::info!("session {} state: {}", self.session, next);
        }
    }

    /// Run `op` unless another operation is pending.
    ///
    /// The check and the move to `Pending` happen under one lock, so two
    /// concurrent callers can never both start.
    pub async fn run<F, Fut>(&self, status: &str, op: F) -> GateOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, MleError>>,
    {
        if !self.claim(status) {
            return GateOutcome::Busy;
        }

        let result = op().await;
        self.settle(status, result)
    }

    /// Run `op` and then `then` under a single claim of the gate.
    ///
    /// `then` runs whatever `op` returned and nothing else can start in
    /// between. The final state follows the outcome of `then`.
    pub async fn run_then<F, Fut, G, Gut>(
        &self,
        status: &str,
        op: F,
        then_status: &str,
        then: G,
    ) -> Vec<GateOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, MleError>>,
        G: FnOnce() -> Gut,
        Gut: Future<Output = Result<Value, MleError>>,
    {
        if !self.claim(status) {
            return vec![GateOutcome::Busy];
        }

        let first = match op().await {
            Ok(data) => GateOutcome::Success {
                status: status.to_string(),
                data,
            },
            Err(e) => {
                tracing::error!("session {} {} failed: {}", self.session, status, e);
                GateOutcome::Failure(e.to_string())
            }
        };
        let result = then().await;
        vec![first, self.settle(then_status, result)]
    }

    fn claim(&self, status: &str) -> bool {
        let mut state = self.lock();
        if !state.accepts_operation() {
            tracing::debug!("session {} busy, rejecting {}", self.session, status);
            return false;
        }
        self.fire(&mut state, GateEvent::Pending);
        true
    }

    fn settle(&self, status: &str, result: Result<Value, MleError>) -> GateOutcome {
        let mut state = self.lock();
        match result {
            Ok(data) => {
                self.fire(&mut state, GateEvent::Success);
                GateOutcome::Success {
                    status: status.to_string(),
                    data,
                }
            }
            Err(e) => {
                tracing::error!("session {} {} failed: {}", self.session, status, e);
                self.fire(&mut state, GateEvent::Failure);
                GateOutcome::Failure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn success_moves_to_active() {
        let gate = Gate::new(1);
        let outcome = gate.run("connected", || async { Ok(json!(1)) }).await;
        assert_eq!(
            outcome,
            GateOutcome::Success {
                status: "connected".into(),
                data: json!(1)
            }
        );
        assert_eq!(gate.state(), GateState::Active);
    }

    #[tokio::test]
    async fn failure_moves_to_inactive() {
        let gate = Gate::new(1);
        gate.run("connected", || async { Ok(Value::Null) }).await;
        let outcome = gate
            .run("saved", || async {
                Err(MleError::Operation("Error on saving contents to file".into()))
            })
            .await;
        assert_eq!(
            outcome,
            GateOutcome::Failure("Error on saving contents to file".into())
        );
        assert_eq!(gate.state(), GateState::Inactive);
    }

    #[tokio::test]
    async fn follow_up_runs_after_a_failed_first_step() {
        let gate = Gate::new(3);
        let outcomes = gate
            .run_then(
                "deployed",
                || async { Err(MleError::Operation("ORA-04063: invalid".into())) },
                "connected",
                || async { Ok(Value::Null) },
            )
            .await;
        assert_eq!(
            outcomes,
            vec![
                GateOutcome::Failure("ORA-04063: invalid".into()),
                GateOutcome::Success {
                    status: "connected".into(),
                    data: Value::Null
                },
            ]
        );
        assert_eq!(gate.state(), GateState::Active);
    }

    #[tokio::test]
    async fn gate_stays_pending_between_the_two_steps() {
        let gate = Arc::new(Gate::new(4));
        let (release, hold) = oneshot::channel::<()>();

        let pair = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.run_then(
                    "deployed",
                    || async { Ok(json!({ "functions": [] })) },
                    "connected",
                    || async move {
                        hold.await.ok();
                        Err(MleError::NotConnected)
                    },
                )
                .await
            })
        };

        while gate.state() != GateState::Pending {
            tokio::task::yield_now().await;
        }
        let squeezed = gate.run("executed", || async { Ok(Value::Null) }).await;
        assert_eq!(squeezed, GateOutcome::Busy);

        release.send(()).ok();
        let outcomes = pair.await.expect("join");
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], GateOutcome::Success { .. }));
        assert!(matches!(outcomes[1], GateOutcome::Failure(_)));
        assert_eq!(gate.state(), GateState::Inactive);
    }

    #[tokio::test]
    async fn pending_gate_rejects_without_invoking() {
        let gate = Arc::new(Gate::new(7));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, hold) = oneshot::channel::<()>();

        let first = {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                gate.run("executed", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    hold.await.ok();
                    Ok(Value::Null)
                })
                .await
            })
        };

        while gate.state() != GateState::Pending {
            tokio::task::yield_now().await;
        }

        let second_calls = Arc::clone(&calls);
        let second = gate
            .run("tested", || async move {
                second_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await;
        assert_eq!(second, GateOutcome::Busy);

        release.send(()).ok();
        let first = first.await.expect("join");
        assert!(matches!(first, GateOutcome::Success { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state(), GateState::Active);
    }
}
