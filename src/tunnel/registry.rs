use std::{collections::HashMap, sync::Arc, time::Duration};

use rand::{RngExt, rng};
use tokio::sync::Mutex;

use crate::tunnel::{
    backend::{Backend, BackendOptions},
    error::TunnelError,
    protocol::Hello,
    stream::{BoxedStream, BoxedWriter},
    target::{DEFAULT_QUEUE_CAPACITY, Target},
};

/// Bound on writing the `ServerHello` reply while the registry is locked.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub backend: BackendOptions,
    pub queue_capacity: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            backend: BackendOptions::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Result of a successful command handshake.
#[derive(Debug)]
pub struct Registration {
    pub target: Arc<Target>,
    pub backend: Arc<Backend>,
    /// The backend was created by this registration; its listener is not
    /// running yet.
    pub created: bool,
}

#[derive(Default)]
struct State {
    backends: HashMap<u16, Arc<Backend>>,
    targets: HashMap<u64, Arc<Target>>,
}

impl State {
    fn drop_members(&mut self, backend: &Backend) {
        for id in backend.member_ids() {
            if let Some(t) = backend.remove_target(id) {
                self.targets.remove(&id);
                t.close();
            }
        }
    }
}

/// Server-wide map of ports to backends and target IDs to targets.
///
/// Every target in the ID map is a member of the backend registered for its
/// port. All lookups and mutations run under one lock.
pub struct Registry {
    opts: RegistryOptions,
    state: Mutex<State>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(opts: RegistryOptions) -> Self {
        Self {
            opts,
            state: Mutex::new(State::default()),
        }
    }

    /// Register a new target for `port`, answering on `cmd` with its ID.
    ///
    /// Joins the backend already serving `port` when the secret matches, or
    /// binds a new one. The reply is written before the target becomes
    /// visible, so no data request can precede it on the wire.
    pub async fn register_command(
        &self,
        port: u16,
        secret: &[u8],
        cmd: BoxedWriter,
    ) -> Result<Registration, TunnelError> {
        let mut st = self.state.lock().await;

        let existing = st
            .backends
            .get(&port)
            .filter(|b| !b.is_stopped())
            .cloned();
        let (backend, created) = match existing {
            Some(b) => {
                if !b.validate_secret(secret) {
                    return Err(TunnelError::RegistryConflict(port));
                }
                (b, false)
            }
            None => {
                if let Some(stale) = st.backends.remove(&port) {
                    st.drop_members(&stale);
                }
                let b = Backend::bind(port, secret.to_vec(), self.opts.backend.clone()).await?;
                (b, true)
            }
        };

        let id = loop {
            let id = rng().random::<u64>();
            if id != 0 && !st.targets.contains_key(&id) {
                break id;
            }
        };

        let target = Arc::new(Target::with_capacity(
            id,
            port,
            cmd,
            self.opts.queue_capacity,
        ));
        tokio::time::timeout(
            REPLY_TIMEOUT,
            target.send_hello(&Hello::server(id, port, secret)),
        )
        .await
        .map_err(|_| TunnelError::timed_out("server hello"))??;

        if created {
            st.backends.insert(port, backend.clone());
        }
        backend.add_target(target.clone());
        st.targets.insert(id, target.clone());

        Ok(Registration {
            target,
            backend,
            created,
        })
    }

    /// Queue a data connection for the target named by `hello`.
    ///
    /// The backend for `hello.port` must exist, its secret must match, and the
    /// target must be one of its members.
    pub async fn register_data(&self, hello: &Hello, conn: BoxedStream) -> Result<u64, TunnelError> {
        let st = self.state.lock().await;

        let backend = st
            .backends
            .get(&hello.port)
            .ok_or(TunnelError::UnknownBackend(hello.port))?;
        if !backend.validate_secret(&hello.secret) {
            return Err(TunnelError::AuthFailure);
        }
        let target = st
            .targets
            .get(&hello.id)
            .filter(|t| t.port() == hello.port && backend.has_member(t.id()))
            .ok_or(TunnelError::UnknownTarget {
                id: hello.id,
                port: hello.port,
            })?;

        target.register_data_conn(conn)?;
        Ok(target.id())
    }

    /// Remove `target` from the ID map and from its backend. The backend stays.
    pub async fn unregister_target(&self, target: &Arc<Target>) -> bool {
        let mut st = self.state.lock().await;
        let owned = st
            .targets
            .get(&target.id())
            .is_some_and(|t| Arc::ptr_eq(t, target));
        if !owned {
            return false;
        }
        st.targets.remove(&target.id());
        if let Some(b) = st.backends.get(&target.port()) {
            b.remove_target(target.id());
        }
        true
    }

    /// Drop `backend` from the port map if the map still points at this exact
    /// instance, closing all of its targets.
    pub async fn remove_backend_if_same(&self, backend: &Arc<Backend>) -> bool {
        let mut st = self.state.lock().await;
        let same = st
            .backends
            .get(&backend.port())
            .is_some_and(|b| Arc::ptr_eq(b, backend));
        if !same {
            return false;
        }
        st.backends.remove(&backend.port());
        st.drop_members(backend);
        true
    }

    pub async fn backend(&self, port: u16) -> Option<Arc<Backend>> {
        self.state.lock().await.backends.get(&port).cloned()
    }

    pub async fn backends(&self) -> Vec<Arc<Backend>> {
        self.state.lock().await.backends.values().cloned().collect()
    }

    pub async fn target_count(&self) -> usize {
        self.state.lock().await.targets.len()
    }
}
