use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::session::unsubscribe_all;
use super::session::Descriptor;
use super::session::SessionId;
use super::session::SessionTask;
use super::session::SubscriptionTables;
use crate::api::SubscribeCapability;
use crate::api::SubscribeRequest;
use crate::auth::Principal;
use crate::config::NotificationConfig;
use crate::coordinator::TransactionCoordinator;
use crate::handler::Verb;
use crate::metrics::ACTIVE_SESSIONS;
use crate::store::key_space_channel;
use crate::store::KeySpaceSink;
use crate::store::StoreIndex;
use crate::store::StoreOptions;
use crate::store::StoreSet;
use crate::store::SubscriptionHandle;
use crate::AppError;
use crate::BackendError;
use crate::Error;
use crate::Result;

/// Outcome of the registering phase.
struct Registration {
    capabilities: Vec<SubscribeCapability>,
    descriptors: Vec<Descriptor>,
    /// First per-path error, reported when no path could be registered
    first_error: Option<Error>,
}

pub(crate) struct NotificationEngine {
    coordinator: Arc<TransactionCoordinator>,
    config: NotificationConfig,
    tables: Arc<Mutex<SubscriptionTables>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU64,
}

impl NotificationEngine {
    pub(crate) fn new(
        coordinator: Arc<TransactionCoordinator>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            coordinator,
            config,
            tables: Arc::new(Mutex::new(SubscriptionTables::default())),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub(crate) fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// Registers `request.paths`, opens the key-space subscriptions and spawns the session
    /// task. Returns one capability entry per requested path, in request order.
    pub(crate) async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<Vec<SubscribeCapability>> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::Subscription("notification engine is shut down".to_string()).into());
        }

        let Registration {
            capabilities,
            mut descriptors,
            first_error,
        } = self.register_paths(&request.paths, &request.principal).await?;

        if descriptors.is_empty() {
            return Err(first_error.unwrap_or_else(|| AppError::InvalidArgs("no paths to subscribe".to_string()).into()));
        }

        let (sink, events) = key_space_channel(self.config.event_buffer_size);
        let handles = self.open_key_spaces(&mut descriptors, sink)?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.insert_session(id, &handles, &descriptors)?;
        ACTIVE_SESSIONS.inc();

        let task = SessionTask {
            id,
            coordinator: self.coordinator.clone(),
            tables: self.tables.clone(),
            descriptors,
            principal: request.principal,
            events,
            output: request.output,
            stop: request.stop,
            shutdown: self.shutdown.clone(),
        };

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task.run()));

        info!(session_id = id, paths = request.paths.len(), subscriptions = handles.len(), "Subscription accepted");
        Ok(capabilities)
    }

    /// Reports per-path streaming capabilities without opening a session.
    pub(crate) async fn is_subscribe_supported(
        &self,
        paths: &[String],
        principal: &Principal,
    ) -> Result<Vec<SubscribeCapability>> {
        Ok(self.register_paths(paths, principal).await?.capabilities)
    }

    async fn register_paths(
        &self,
        paths: &[String],
        principal: &Principal,
    ) -> Result<Registration> {
        self.coordinator.authorizer().authorize(principal, Verb::Subscribe)?;
        let stores = StoreSet::open(self.coordinator.client(), self.coordinator.indices(), true).await?;

        let mut registration = Registration {
            capabilities: Vec::with_capacity(paths.len()),
            descriptors: Vec::new(),
            first_error: None,
        };

        for path in paths {
            match self.register_path(&stores, path, principal).await {
                Ok((capability, descriptor)) => {
                    registration.capabilities.push(capability);
                    registration.descriptors.push(descriptor);
                }
                Err(e) => {
                    debug!(%path, error = %e, "Path can not be subscribed");
                    registration.capabilities.push(SubscribeCapability::failed(path, &e));
                    if registration.first_error.is_none() {
                        registration.first_error = Some(e);
                    }
                }
            }
        }
        Ok(registration)
    }

    async fn register_path(
        &self,
        stores: &StoreSet,
        path: &str,
        principal: &Principal,
    ) -> Result<(SubscribeCapability, Descriptor)> {
        let mut prepared = self.coordinator.prepare(Verb::Subscribe, path, Bytes::new(), principal)?;
        let translation = prepared.handler.translate_subscribe(stores, path).await?;

        let spec = translation
            .descriptor
            .ok_or_else(|| AppError::NotSupported(format!("{path}: on-change notifications")))?;
        let capability = SubscribeCapability::supported(path, translation.options.unwrap_or_default());

        Ok((
            capability,
            Descriptor {
                path: path.to_string(),
                info: prepared.info,
                spec,
                handle: None,
                cache: None,
            },
        ))
    }

    /// Opens one key-space subscription per store index. On failure every subscription
    /// opened so far is closed again.
    fn open_key_spaces(
        &self,
        descriptors: &mut [Descriptor],
        sink: KeySpaceSink,
    ) -> Result<Vec<SubscriptionHandle>> {
        let mut groups: BTreeMap<StoreIndex, Vec<usize>> = BTreeMap::new();
        for (i, descriptor) in descriptors.iter().enumerate() {
            groups.entry(descriptor.spec.index).or_default().push(i);
        }

        let client = self.coordinator.client();
        let mut handles = Vec::with_capacity(groups.len());
        for (index, members) in groups {
            let patterns = members.iter().map(|i| descriptors[*i].pattern()).collect();
            match client.subscribe_key_space(StoreOptions::read_only(index), patterns, sink.clone()) {
                Ok(handle) => {
                    for i in members {
                        descriptors[i].handle = Some(handle);
                    }
                    handles.push(handle);
                }
                Err(e) => {
                    warn!(%index, error = %e, "Key-space subscription could not be opened");
                    unsubscribe_all(client, &handles);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    fn insert_session(
        &self,
        id: SessionId,
        handles: &[SubscriptionHandle],
        descriptors: &[Descriptor],
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        if self.config.is_session_limited() && tables.len() >= self.config.max_sessions {
            unsubscribe_all(self.coordinator.client(), handles);
            return Err(BackendError::Subscription(format!(
                "session limit of {} reached",
                self.config.max_sessions
            ))
            .into());
        }
        tables.insert(id, handles.to_vec(), descriptors.iter().map(|d| d.path.clone()).collect());
        Ok(())
    }

    pub(crate) fn session_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Stops every session and waits for their tasks to finish.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();

        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Subscription session task failed");
            }
        }
        info!(sessions = count, "Notification engine stopped");
    }
}
