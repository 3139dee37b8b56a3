//! Server side of the engine.
//!
//! The [`Server`] owns the session registry and a single timer heap that drives every
//! monitored item's sampling, every subscription's publish cycle and every publish
//! request's timeout. Timers only fire when something calls [`Server::run_due`]:
//! tests do that through [`Server::advance`] on a [`ManualClock`], and real deployments
//! start a [`TimerThread`] with [`Server::spawn_timer_thread`].

pub(crate) mod manager;
pub(crate) mod scheduler;
pub mod session;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::address_space::AddressSpace;
use crate::config::ServerConfig;
use crate::error::{ConfigurationError, ServiceError, UaError, UaResult};
use crate::subscription::{MonitoredItemId, SubscriptionId};
use crate::time::{Clock, ManualClock};

use scheduler::{Scheduler, TimerKey};

pub use session::{Session, SessionId, UserIdentity};

/// Longest the timer thread sleeps before re-checking the heap. New timers scheduled
/// while it sleeps are therefore picked up within this bound.
const TIMER_THREAD_MAX_WAIT: Duration = Duration::from_millis(10);

/// State shared between the server and its sessions.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) address_space: Arc<dyn AddressSpace>,
    scheduler: Mutex<Scheduler>,
    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
    next_request_id: AtomicU64,
}

impl ServerContext {
    /// Runs `f` with the scheduler locked and the current clock reading.
    pub(crate) fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler, Duration) -> R) -> UaResult<R> {
        let now = self.clock.now();
        let mut scheduler = self.scheduler.lock().map_err(|_| UaError::poisoned("scheduler"))?;
        Ok(f(&mut scheduler, now))
    }

    pub(crate) fn allocate_subscription_id(&self) -> SubscriptionId {
        SubscriptionId::new(self.next_subscription_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_item_id(&self) -> MonitoredItemId {
        MonitoredItemId::new(self.next_item_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("application_name", &self.config.application_name)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// The subscription server.
#[derive(Debug)]
pub struct Server {
    ctx: Arc<ServerContext>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Server {
    /// Creates a server over `address_space`, timed by `clock`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(config: ServerConfig, address_space: Arc<dyn AddressSpace>, clock: Arc<dyn Clock>) -> UaResult<Self> {
        config.validate()?;
        info!(
            application_name = %config.application_name,
            product_name = %config.build_info.product_name,
            "server initialized"
        );
        Ok(Self {
            ctx: Arc::new(ServerContext {
                config,
                clock,
                address_space,
                scheduler: Mutex::new(Scheduler::new()),
                next_subscription_id: AtomicU32::new(1),
                next_item_id: AtomicU32::new(1),
                next_request_id: AtomicU64::new(1),
            }),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Configuration the server was created with.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Clock driving sampling and publishing.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.ctx.clock
    }

    /// The address space sessions read from.
    #[must_use]
    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.ctx.address_space
    }

    /// Authenticates `identity` and opens a session.
    ///
    /// # Errors
    ///
    /// - `AccessDenied` if the identity is not accepted
    /// - `TooManySessions` if the server is at its session limit
    pub fn create_session(&self, identity: &UserIdentity) -> UaResult<Arc<Session>> {
        self.authenticate(identity)?;

        let mut sessions = self.sessions.write().map_err(|_| UaError::poisoned("sessions"))?;
        sessions.retain(|_, s| s.is_open());

        let max = self.ctx.config.limits.max_sessions;
        if sessions.len() >= max {
            return Err(ConfigurationError::TooManySessions { max }.into());
        }

        let session = Arc::new(Session::new(Arc::clone(&self.ctx), identity));
        sessions.insert(session.id(), Arc::clone(&session));
        info!(session_id = %session.id(), user = %session.user(), "session created");
        Ok(session)
    }

    fn authenticate(&self, identity: &UserIdentity) -> UaResult<()> {
        let accepted = match identity {
            UserIdentity::Anonymous => self.ctx.config.allow_anonymous,
            UserIdentity::UserName { username, password } => self
                .ctx
                .config
                .users
                .iter()
                .any(|u| u.username == *username && u.password == *password),
        };
        if accepted {
            Ok(())
        } else {
            warn!(user = %identity.display_name(), "session rejected");
            Err(ServiceError::AccessDenied {
                user: identity.display_name().to_string(),
            }
            .into())
        }
    }

    /// Looks up an open session.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().ok()?;
        sessions.get(&id).filter(|s| s.is_open()).cloned()
    }

    /// Closes and forgets a session.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock is poisoned. Unknown ids are ignored.
    pub fn close_session(&self, id: SessionId) -> UaResult<()> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| UaError::poisoned("sessions"))?
            .remove(&id);
        match removed {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .map(|s| s.values().filter(|s| s.is_open()).count())
            .unwrap_or(0)
    }

    /// Closes every session.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; remaining sessions are still closed.
    pub fn shutdown(&self) -> UaResult<()> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .map_err(|_| UaError::poisoned("sessions"))?
            .drain()
            .map(|(_, s)| s)
            .collect();

        let mut first_err = None;
        for session in sessions {
            if let Err(e) = session.close() {
                first_err.get_or_insert(e);
            }
        }
        info!("server shut down");
        first_err.map_or(Ok(()), Err)
    }

    /// Fires every timer due at the current clock reading. Returns how many fired.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the scheduler lock is poisoned. Failures inside a
    /// single timer are logged and do not stop the others.
    pub fn run_due(&self) -> UaResult<usize> {
        let now = self.ctx.clock.now();
        let mut fired = 0;
        while let Some((key, _)) = self.ctx.with_scheduler(|s, _| s.pop_due(now))? {
            fired += 1;
            let keep = match self.dispatch(key) {
                Ok(keep) => keep,
                Err(e) => {
                    warn!(error = %e, timer = ?key, "timer dispatch failed");
                    false
                }
            };
            if !keep {
                self.ctx.with_scheduler(|s, _| s.cancel(&key))?;
            }
        }
        Ok(fired)
    }

    fn dispatch(&self, key: TimerKey) -> UaResult<bool> {
        let session_id = match key {
            TimerKey::Sample { session, .. } | TimerKey::Publish { session, .. } | TimerKey::PublishTimeout { session, .. } => session,
        };
        let Some(session) = self.session(session_id) else {
            return Ok(false);
        };

        match key {
            TimerKey::Sample { subscription, item, .. } => session.sample_item(subscription, item),
            TimerKey::Publish { subscription, .. } => session.publish_tick(subscription),
            TimerKey::PublishTimeout {
                subscription, request, ..
            } => {
                session.expire_publish_request(subscription, request)?;
                Ok(false)
            }
        }
    }

    /// Deadline of the earliest pending timer, as an offset from the clock's origin.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the scheduler lock is poisoned.
    pub fn next_due(&self) -> UaResult<Option<Duration>> {
        self.ctx.with_scheduler(|s, _| s.next_due())
    }

    /// Moves `clock` forward by `by`, stopping at every timer deadline on the way so
    /// each timer fires at its own virtual time. `clock` must be the server's clock.
    ///
    /// Returns how many timers fired.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the scheduler lock is poisoned.
    pub fn advance(&self, clock: &ManualClock, by: Duration) -> UaResult<usize> {
        let target = clock.now() + by;
        let mut fired = self.run_due()?;
        while let Some(due) = self.next_due()? {
            if due > target {
                break;
            }
            clock.set(due);
            fired += self.run_due()?;
        }
        clock.set(target);
        fired += self.run_due()?;
        Ok(fired)
    }

    /// Starts a thread that fires timers in real time until the returned handle is
    /// stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the thread cannot be spawned.
    pub fn spawn_timer_thread(self: &Arc<Self>) -> UaResult<TimerThread> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let server = Arc::clone(self);

        let join = thread::Builder::new()
            .name("uasub-timer".to_string())
            .spawn(move || loop {
                if let Err(e) = server.run_due() {
                    warn!(error = %e, "timer thread failed to run timers");
                }
                let wait = match server.next_due() {
                    Ok(Some(due)) => due.saturating_sub(server.ctx.clock.now()).min(TIMER_THREAD_MAX_WAIT),
                    _ => TIMER_THREAD_MAX_WAIT,
                };
                match shutdown_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| UaError::internal(format!("failed to spawn timer thread: {e}")))?;

        Ok(TimerThread {
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

/// Handle to the real-time timer thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct TimerThread {
    shutdown_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl TimerThread {
    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::InMemoryAddressSpace;
    use crate::config::UserCredential;
    use crate::subscription::SubscriptionParameters;

    fn server(config: ServerConfig) -> (Server, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let space = Arc::new(InMemoryAddressSpace::new());
        (Server::new(config, space, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn anonymous_sessions_follow_config() {
        let (srv, _) = server(ServerConfig::default());
        assert!(srv.create_session(&UserIdentity::Anonymous).is_ok());

        let config = ServerConfig {
            allow_anonymous: false,
            users: vec![UserCredential {
                username: "operator".to_string(),
                password: "secret".to_string(),
            }],
            ..ServerConfig::default()
        };
        let (srv, _) = server(config);
        let err = srv.create_session(&UserIdentity::Anonymous).unwrap_err();
        assert_eq!(err.status_code(), crate::status::StatusCode::BadUserAccessDenied);
        assert!(srv
            .create_session(&UserIdentity::user_name("operator", "wrong"))
            .is_err());
        assert!(srv
            .create_session(&UserIdentity::user_name("operator", "secret"))
            .is_ok());
    }

    #[test]
    fn session_limit_counts_only_open_sessions() {
        let mut config = ServerConfig::default();
        config.limits.max_sessions = 1;
        let (srv, _) = server(config);

        let first = srv.create_session(&UserIdentity::Anonymous).unwrap();
        assert!(matches!(
            srv.create_session(&UserIdentity::Anonymous).unwrap_err(),
            UaError::Configuration(ConfigurationError::TooManySessions { max: 1 })
        ));
        first.close().unwrap();
        assert!(srv.create_session(&UserIdentity::Anonymous).is_ok());
    }

    #[test]
    fn advance_fires_each_publish_tick_at_its_own_time() {
        let (srv, clock) = server(ServerConfig::default());
        let session = srv.create_session(&UserIdentity::Anonymous).unwrap();
        session
            .create_subscription(&SubscriptionParameters {
                publishing_interval: Duration::from_millis(100),
                ..SubscriptionParameters::default()
            })
            .unwrap();

        assert_eq!(srv.advance(&clock, Duration::from_millis(350)).unwrap(), 3);
        assert_eq!(clock.now(), Duration::from_millis(350));
        assert_eq!(srv.next_due().unwrap(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn closing_a_session_cancels_its_timers() {
        let (srv, clock) = server(ServerConfig::default());
        let session = srv.create_session(&UserIdentity::Anonymous).unwrap();
        session.create_subscription(&SubscriptionParameters::default()).unwrap();

        srv.close_session(session.id()).unwrap();
        assert_eq!(srv.next_due().unwrap(), None);
        assert_eq!(srv.advance(&clock, Duration::from_secs(5)).unwrap(), 0);
        assert_eq!(srv.session_count(), 0);
    }

    #[test]
    fn timer_thread_stops_on_drop() {
        let srv = Arc::new(
            Server::new(
                ServerConfig::default(),
                Arc::new(InMemoryAddressSpace::new()),
                Arc::new(crate::time::SystemClock::new()),
            )
            .unwrap(),
        );
        let timer = srv.spawn_timer_thread().unwrap();
        drop(timer);
        assert_eq!(Arc::strong_count(&srv), 1);
    }
}
