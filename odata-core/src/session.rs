//! Session with lazily resolved metadata.
//!
//! A [Session] resolves its [MetadataProvider] on first use through an
//! [AdapterResolver]. Resolution is single-flight: concurrent callers share
//! one in-flight fetch and all receive its result. The shared fetch is held
//! only by its waiters, the session keeps a weak handle; when every waiter is
//! gone (e.g. all were cancelled) the fetch is dropped and the next caller
//! starts a new one. A failed fetch leaves the session unresolved, so the
//! next call retries.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandModel;
use crate::compiler::{CommandCompiler, Mutation};
use crate::error::Error;
use crate::metadata::MetadataProvider;
use crate::request::{DefaultRequestWriter, RequestDescriptor};
use crate::settings::{ClientSettings, Credentials};

/// Produces the metadata of a service.
#[async_trait]
pub trait AdapterResolver: Send + Sync {
    /// The token is cancelled when nobody waits for the result anymore.
    async fn resolve_adapter(
        &self,
        url_base: &str,
        credentials: Option<&Credentials>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn MetadataProvider>, Error>;
}

type MetadataResult = Result<Arc<dyn MetadataProvider>, Error>;
type ResolveFuture = BoxFuture<'static, MetadataResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unresolved,
    Resolving,
    Resolved,
}

enum Slot {
    Unresolved,
    Resolving {
        generation: u64,
        fetch: WeakShared<ResolveFuture>,
    },
    Resolved(Arc<dyn MetadataProvider>),
}

struct Inner {
    slot: Slot,
    generation: u64,
}

pub struct Session {
    settings: ClientSettings,
    resolver: Arc<dyn AdapterResolver>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(settings: ClientSettings, resolver: Arc<dyn AdapterResolver>) -> Self {
        Session {
            settings,
            resolver,
            inner: Mutex::new(Inner {
                slot: Slot::Unresolved,
                generation: 0,
            }),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        match &self.lock().slot {
            Slot::Unresolved => SessionState::Unresolved,
            Slot::Resolving { fetch, .. } if fetch.upgrade().is_some() => SessionState::Resolving,
            Slot::Resolving { .. } => SessionState::Unresolved,
            Slot::Resolved(_) => SessionState::Resolved,
        }
    }

    /// Resolved metadata, without waiting.
    pub fn metadata(&self) -> Option<Arc<dyn MetadataProvider>> {
        match &self.lock().slot {
            Slot::Resolved(metadata) => Some(metadata.clone()),
            _ => None,
        }
    }

    fn start_fetch(&self) -> Shared<ResolveFuture> {
        let resolver = self.resolver.clone();
        let url_base = self.settings.url_base.clone();
        let credentials = self.settings.credentials.clone();
        let token = CancellationToken::new();
        // cancels the resolver when the last waiter drops the fetch
        let guard = token.clone().drop_guard();
        info!("Resolving metadata for {}", url_base);
        async move {
            let _guard = guard;
            resolver
                .resolve_adapter(&url_base, credentials.as_ref(), &token)
                .await
        }
        .boxed()
        .shared()
    }

    /// Join the fetch in flight or start a new one.
    fn join(&self) -> Result<(u64, Shared<ResolveFuture>), Arc<dyn MetadataProvider>> {
        let mut inner = self.lock();
        match &inner.slot {
            Slot::Resolved(metadata) => return Err(metadata.clone()),
            Slot::Resolving { generation, fetch } => {
                if let Some(fetch) = fetch.upgrade() {
                    debug!("Joining metadata resolution #{}", generation);
                    return Ok((*generation, fetch));
                }
            }
            Slot::Unresolved => {}
        }
        inner.generation += 1;
        let generation = inner.generation;
        let fetch = self.start_fetch();
        inner.slot = match fetch.downgrade() {
            Some(weak) => Slot::Resolving {
                generation,
                fetch: weak,
            },
            None => Slot::Unresolved,
        };
        Ok((generation, fetch))
    }

    /// Resolve the metadata, waiting for a resolution already in flight.
    ///
    /// A cancelled caller gets [Error::cancelled]; other waiters are not affected.
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<Arc<dyn MetadataProvider>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let (generation, fetch) = match self.join() {
            Ok(joined) => joined,
            Err(metadata) => return Ok(metadata),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Waiter of metadata resolution #{} cancelled", generation);
                return Err(Error::cancelled());
            }
            result = fetch => result,
        };

        let mut inner = self.lock();
        match &result {
            Ok(metadata) => {
                if !matches!(inner.slot, Slot::Resolved(_)) {
                    info!("Metadata for {} resolved", self.settings.url_base);
                    inner.slot = Slot::Resolved(metadata.clone());
                }
            }
            Err(e) => {
                if matches!(inner.slot, Slot::Resolving { generation: g, .. } if g == generation) {
                    warn!("Metadata resolution for {} failed: {}", self.settings.url_base, e);
                    inner.slot = Slot::Unresolved;
                }
            }
        }
        result
    }

    fn compiler<'a>(&self, metadata: &'a dyn MetadataProvider) -> CommandCompiler<'a> {
        let compiler = CommandCompiler::new(metadata);
        match self.settings.protocol_revision {
            Some(revision) => compiler.with_revision(revision),
            None => compiler,
        }
    }

    /// Resolve the metadata and compile a read command.
    pub async fn compile_text(
        &self,
        command: &CommandModel,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let metadata = self.resolve(cancel).await?;
        self.compiler(metadata.as_ref()).compile_text(command)
    }

    /// Resolve the metadata and compile a command for a verb.
    pub async fn compile_request(
        &self,
        command: &CommandModel,
        mutation: Mutation,
        cancel: &CancellationToken,
    ) -> Result<RequestDescriptor, Error> {
        let metadata = self.resolve(cancel).await?;
        self.compiler(metadata.as_ref()).compile_request(command, mutation)
    }

    pub fn request_writer(&self) -> Result<DefaultRequestWriter, Error> {
        DefaultRequestWriter::from_settings(&self.settings)
    }
}
