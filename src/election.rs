//! Election Engine
//!
//! Decides, for each observation of the leadership key, whether to try to
//! take the lock or to follow whoever holds it. The engine keeps no notion
//! of its own role between calls: the coordination service's current state
//! is the only source of truth, so a stale local belief can never produce a
//! second leader. Mutual exclusion rests entirely on the service's atomic
//! acquire.

use std::sync::Arc;
use tokio::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::{Coordinator, Observation};
use crate::error::Result;
use crate::identity::{ServiceIdentity, SessionId};
use crate::session::SessionManager;

/// Outcome of evaluating one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The key was free and this process just took it
    Elected,
    /// The key was free but another process took it first
    LostRace,
    /// The key is already held by this process's session
    Leading,
    /// The key is held by another session
    Following {
        /// Identity stored in the key, if it could be decoded
        leader: Option<ServiceIdentity>,
        /// Session holding the lock
        session: SessionId,
    },
}

impl Decision {
    /// Whether this process holds leadership after the decision
    pub fn is_leader(&self) -> bool {
        matches!(self, Decision::Elected | Decision::Leading)
    }
}

/// Decision plus the index the next blocking read should wait on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub next_index: u64,
}

/// Role as published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// No observation evaluated yet
    Starting,
    /// This process holds the leadership key
    Leader,
    /// Another process holds (or just won) the leadership key
    Follower,
    /// The election loop has stopped
    Stopped,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Starting => write!(f, "STARTING"),
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Snapshot of this node's view of the election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipStatus {
    /// This instance
    pub identity: ServiceIdentity,
    /// Current role
    pub role: Role,
    /// Known leader, if any
    pub leader: Option<ServiceIdentity>,
    /// Session holding the leadership key, if known
    pub leader_session: Option<SessionId>,
    /// Index of the observation the status was derived from
    pub index: u64,
    /// When the status was derived
    pub updated_at: DateTime<Utc>,
}

impl LeadershipStatus {
    /// Status before the first evaluation
    pub fn starting(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            role: Role::Starting,
            leader: None,
            leader_session: None,
            index: 0,
            updated_at: Utc::now(),
        }
    }

    /// Status derived from an evaluation
    pub fn from_evaluation(identity: &ServiceIdentity, evaluation: &Evaluation, session: Option<SessionId>) -> Self {
        let (role, leader, leader_session) = match &evaluation.decision {
            Decision::Elected | Decision::Leading => (Role::Leader, Some(identity.clone()), session),
            Decision::LostRace => (Role::Follower, None, None),
            Decision::Following { leader, session } => {
                (Role::Follower, leader.clone(), Some(session.clone()))
            }
        };
        Self {
            identity: identity.clone(),
            role,
            leader,
            leader_session,
            index: evaluation.next_index,
            updated_at: Utc::now(),
        }
    }

    /// Same status, marked as stopped
    pub fn stopped(mut self) -> Self {
        self.role = Role::Stopped;
        self.updated_at = Utc::now();
        self
    }
}

/// Per-observation election decision maker
pub struct ElectionEngine {
    identity: ServiceIdentity,
    key: String,
    value: Vec<u8>,
    coordinator: Arc<dyn Coordinator>,
    sessions: Arc<SessionManager>,
    /// Session that last held the key, as far as this process knows
    holding: Mutex<Option<SessionId>>,
}

impl ElectionEngine {
    /// Create an engine competing for `identity`'s leadership key
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        identity: ServiceIdentity,
        sessions: Arc<SessionManager>,
    ) -> Result<Self> {
        let value = identity.encode()?;
        Ok(Self {
            key: identity.leader_key(),
            identity,
            value,
            coordinator,
            sessions,
            holding: Mutex::new(None),
        })
    }

    /// Leadership key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decide what to do about one observation of the leadership key
    pub async fn evaluate(&self, observation: &Observation) -> Result<Evaluation> {
        tracing::debug!(
            "Leader key {} at index {}: locked by {:?}",
            observation.key,
            observation.index,
            observation.lock_holder()
        );

        let decision = match observation.lock_holder() {
            Some(holder) => {
                if self.sessions.current().await.as_ref() == Some(holder) {
                    tracing::debug!("Still leader {} (session {})", self.identity, holder);
                    *self.holding.lock().await = Some(holder.clone());
                    Decision::Leading
                } else {
                    let leader = observation
                        .value()
                        .and_then(|raw| ServiceIdentity::decode(&self.identity.name, raw));
                    tracing::info!(
                        "Leader session: {}, value: {}",
                        holder,
                        leader.as_ref().map(|l| l.id.as_str()).unwrap_or("<unreadable>")
                    );
                    Decision::Following {
                        leader,
                        session: holder.clone(),
                    }
                }
            }
            None => {
                self.forget_released_session(observation).await;
                self.try_acquire().await?
            }
        };

        Ok(Evaluation {
            decision,
            next_index: observation.index,
        })
    }

    /// An unlocked key that still names this process means the lock was
    /// taken away from the session that held it; that session cannot be
    /// trusted again. A session that never held the key is left alone.
    async fn forget_released_session(&self, observation: &Observation) {
        let Some(session) = self.sessions.current().await else {
            return;
        };
        let mut holding = self.holding.lock().await;
        if holding.as_ref() != Some(&session) {
            return;
        }
        let ours = observation
            .value()
            .and_then(|raw| ServiceIdentity::decode(&self.identity.name, raw))
            .is_some_and(|holder| holder == self.identity);
        if !ours {
            return;
        }
        *holding = None;
        drop(holding);

        tracing::warn!(
            "Leadership of {} released from session {} without stepping down, session lost",
            self.key,
            session
        );
        if self.sessions.invalidate(&session).await {
            if let Err(e) = self.coordinator.destroy_session(&session).await {
                tracing::debug!("Could not destroy lost session {}: {}", session, e);
            }
        }
    }

    /// Compare-and-swap the leadership key with our current session
    async fn try_acquire(&self) -> Result<Decision> {
        let session = self.sessions.get_or_create().await?;
        let (session, acquired) = match self.coordinator.acquire(&self.key, &self.value, &session).await {
            Err(e) if e.invalidates_session() => {
                tracing::warn!("Acquire with session {} rejected: {}", session, e);
                self.sessions.invalidate(&session).await;
                let fresh = self.sessions.get_or_create().await?;
                let acquired = self.coordinator.acquire(&self.key, &self.value, &fresh).await?;
                (fresh, acquired)
            }
            result => (session, result?),
        };

        if acquired {
            *self.holding.lock().await = Some(session);
            tracing::warn!("I'm leader {}", self.identity);
            Ok(Decision::Elected)
        } else {
            tracing::info!("I'm not leader {}", self.identity);
            Ok(Decision::LostRace)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{InMemoryCoordinator, ServiceRegistration, TtlCheck};
    use crate::error::Error;
    use std::time::Duration;

    struct Contender {
        identity: ServiceIdentity,
        sessions: Arc<SessionManager>,
        engine: ElectionEngine,
    }

    async fn contender(sim: &Arc<InMemoryCoordinator>, id: &str, ttl: Duration) -> Contender {
        contender_with_lock_delay(sim, id, ttl, Duration::ZERO).await
    }

    async fn contender_with_lock_delay(
        sim: &Arc<InMemoryCoordinator>,
        id: &str,
        ttl: Duration,
        lock_delay: Duration,
    ) -> Contender {
        let identity = ServiceIdentity::new("svc", id);
        sim.register_service(&ServiceRegistration {
            id: identity.id.clone(),
            name: identity.name.clone(),
            check: TtlCheck {
                id: identity.check_id(),
                ttl,
                deregister_after: Duration::from_secs(60),
            },
        })
        .await
        .unwrap();
        sim.report_check_passing(&identity.check_id()).await.unwrap();

        let sessions = Arc::new(SessionManager::new(sim.clone(), &identity, lock_delay));
        let engine = ElectionEngine::new(sim.clone(), identity.clone(), Arc::clone(&sessions)).unwrap();
        Contender {
            identity,
            sessions,
            engine,
        }
    }

    #[tokio::test]
    async fn test_fresh_process_wins_first_evaluate() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;

        let observation = sim.read_key(a.engine.key()).await.unwrap();
        assert!(observation.entry.is_none());

        let evaluation = a.engine.evaluate(&observation).await.unwrap();
        assert_eq!(evaluation.decision, Decision::Elected);
        assert_eq!(evaluation.next_index, observation.index);

        let after = sim.read_key(a.engine.key()).await.unwrap();
        assert_eq!(after.lock_holder(), a.sessions.current().await.as_ref());
        assert_eq!(
            ServiceIdentity::decode("svc", after.value().unwrap()),
            Some(a.identity.clone())
        );
    }

    #[tokio::test]
    async fn test_race_at_same_index_has_one_winner() {
        let sim = Arc::new(InMemoryCoordinator::with_index(5));
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;
        let b = contender(&sim, "svc-b", Duration::from_secs(5)).await;

        let seen = sim.read_key(a.engine.key()).await.unwrap();
        assert_eq!(seen.index, 5);
        assert!(!seen.is_locked());

        let (ra, rb) = tokio::join!(a.engine.evaluate(&seen), b.engine.evaluate(&seen));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        let decisions = [&ra.decision, &rb.decision];
        assert_eq!(decisions.iter().filter(|d| **d == &Decision::Elected).count(), 1);
        assert_eq!(decisions.iter().filter(|d| **d == &Decision::LostRace).count(), 1);

        let (winner, loser, loser_eval) = if ra.decision == Decision::Elected {
            (&a, &b, &rb)
        } else {
            (&b, &a, &ra)
        };

        // the loser's next blocking read returns the winner
        let next = sim
            .blocking_read(loser.engine.key(), loser_eval.next_index, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(next.index > 5);
        let evaluation = loser.engine.evaluate(&next).await.unwrap();
        assert_eq!(
            evaluation.decision,
            Decision::Following {
                leader: Some(winner.identity.clone()),
                session: winner.sessions.current().await.unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_re_evaluation_is_idempotent() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;
        let b = contender(&sim, "svc-b", Duration::from_secs(5)).await;

        let initial = sim.read_key(a.engine.key()).await.unwrap();
        assert_eq!(a.engine.evaluate(&initial).await.unwrap().decision, Decision::Elected);

        let locked = sim.read_key(a.engine.key()).await.unwrap();
        let first = b.engine.evaluate(&locked).await.unwrap();
        let second = b.engine.evaluate(&locked).await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(first.decision, Decision::Following { .. }));
        // b never needed a session
        assert_eq!(b.sessions.current().await, None);
        assert_eq!(sim.read_key(a.engine.key()).await.unwrap().index, locked.index);
    }

    #[tokio::test]
    async fn test_leader_recognises_itself() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;

        let initial = sim.read_key(a.engine.key()).await.unwrap();
        a.engine.evaluate(&initial).await.unwrap();

        let locked = sim.read_key(a.engine.key()).await.unwrap();
        let evaluation = a.engine.evaluate(&locked).await.unwrap();
        assert_eq!(evaluation.decision, Decision::Leading);
        assert!(evaluation.decision.is_leader());
    }

    #[tokio::test]
    async fn test_lost_session_is_replaced() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;

        let initial = sim.read_key(a.engine.key()).await.unwrap();
        a.engine.evaluate(&initial).await.unwrap();
        let first = a.sessions.current().await.unwrap();

        // the service drops the session behind our back
        sim.destroy_session(&first).await.unwrap();
        let released = sim.read_key(a.engine.key()).await.unwrap();
        assert!(!released.is_locked());

        let evaluation = a.engine.evaluate(&released).await.unwrap();
        assert_eq!(evaluation.decision, Decision::Elected);
        let second = a.sessions.current().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(sim.sessions_created(), 2);
    }

    #[tokio::test]
    async fn test_released_observation_during_lock_delay_keeps_new_session() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender_with_lock_delay(&sim, "svc-a", Duration::from_secs(5), Duration::from_secs(2)).await;

        let initial = sim.read_key(a.engine.key()).await.unwrap();
        assert_eq!(a.engine.evaluate(&initial).await.unwrap().decision, Decision::Elected);
        let first = a.sessions.current().await.unwrap();

        // the lock is released and stays unacquirable for the lock-delay
        sim.destroy_session(&first).await.unwrap();
        let released = sim.read_key(a.engine.key()).await.unwrap();

        let round1 = a.engine.evaluate(&released).await.unwrap();
        assert_eq!(round1.decision, Decision::LostRace);
        let second = a.sessions.current().await.unwrap();
        assert_ne!(first, second);

        // the same observation again, e.g. after the shortened wait timed out
        let round2 = a.engine.evaluate(&released).await.unwrap();
        assert_eq!(round2, round1);
        assert_eq!(a.sessions.current().await, Some(second.clone()));
        assert!(sim.session_exists(&second));
        assert_eq!(sim.sessions_created(), 2);
    }

    #[tokio::test]
    async fn test_rejected_session_is_replaced_on_acquire() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;

        // session dies before it ever held anything
        let stale = a.sessions.get_or_create().await.unwrap();
        sim.destroy_session(&stale).await.unwrap();

        let observation = sim.read_key(a.engine.key()).await.unwrap();
        let evaluation = a.engine.evaluate(&observation).await.unwrap();
        assert_eq!(evaluation.decision, Decision::Elected);
        assert_ne!(a.sessions.current().await.unwrap(), stale);
    }

    #[tokio::test]
    async fn test_unavailable_session_creation_fails_evaluate() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = contender(&sim, "svc-a", Duration::from_secs(5)).await;
        let observation = sim.read_key(a.engine.key()).await.unwrap();

        sim.set_available(false);
        let err = a.engine.evaluate(&observation).await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        assert_eq!(a.sessions.current().await, None);
    }

    #[tokio::test]
    async fn test_status_from_evaluation() {
        let me = ServiceIdentity::new("svc", "svc-a");
        let other = ServiceIdentity::new("svc", "svc-b");

        let leading = Evaluation {
            decision: Decision::Elected,
            next_index: 8,
        };
        let status = LeadershipStatus::from_evaluation(&me, &leading, Some(SessionId::new("s1")));
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.leader, Some(me.clone()));
        assert_eq!(status.index, 8);

        let following = Evaluation {
            decision: Decision::Following {
                leader: Some(other.clone()),
                session: SessionId::new("s2"),
            },
            next_index: 9,
        };
        let status = LeadershipStatus::from_evaluation(&me, &following, None);
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.leader, Some(other));
        assert_eq!(status.leader_session, Some(SessionId::new("s2")));
        assert_eq!(status.stopped().role, Role::Stopped);
    }
}
