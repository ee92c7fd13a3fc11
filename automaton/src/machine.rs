//! Mutations, the deterministic apply loop, and snapshot plumbing.

use crate::{WireReader, WireResult, WireWriter};
use async_core::{AsyncError, Invoker, Promise, PromiseFuture, SerialInvoker};
use bytes::Bytes;
use observability_deps::tracing::{debug, error};
use parking_lot::Mutex;
use snafu::Snafu;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Versions the mutation and snapshot formats. Appended to every mutation
/// record; loaders refuse reigns they do not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reign(pub u32);

/// The reign this build produces.
pub const CURRENT_REIGN: Reign = Reign(3);
/// The oldest reign this build still applies.
pub const MIN_SUPPORTED_REIGN: Reign = Reign(1);

impl Reign {
    /// Whether this build can apply records of `self`.
    pub fn is_supported(&self) -> bool {
        *self >= MIN_SUPPORTED_REIGN && *self <= CURRENT_REIGN
    }
}

impl fmt::Display for Reign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replicated state machine command: an opaque payload dispatched to the
/// handler registered under `method`.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Name of the registered handler.
    pub method: String,
    /// Encoded arguments, see [`crate::WireWriter`].
    pub payload: Bytes,
    /// Format version the payload was produced under.
    pub reign: Reign,
}

impl Mutation {
    /// A mutation of the current reign.
    pub fn new(method: impl Into<String>, payload: Bytes) -> Self {
        Self {
            method: method.into(),
            payload,
            reign: CURRENT_REIGN,
        }
    }
}

/// Errors submitting mutations or loading snapshots.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display(
        "unsupported reign {reign}, supported range is {}..={}",
        MIN_SUPPORTED_REIGN,
        CURRENT_REIGN
    ))]
    UnsupportedReign { reign: Reign },

    #[snafu(display("no handler registered for mutation method '{method}'"))]
    UnknownMethod { method: String },

    #[snafu(display("snapshot section '{name}' has no registered loader"))]
    UnknownSnapshotSection { name: String },

    #[snafu(display("snapshot is malformed: {source}"))]
    MalformedSnapshot { source: crate::WireError },

    #[snafu(display("snapshot section '{name}' is malformed: {source}"))]
    MalformedSnapshotSection {
        name: String,
        source: crate::WireError,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context handed to snapshot savers; wraps the output stream.
#[derive(Debug, Default)]
pub struct SaveContext {
    writer: WireWriter,
}

impl SaveContext {
    /// The underlying wire writer.
    pub fn writer(&mut self) -> &mut WireWriter {
        &mut self.writer
    }

    /// Finish and take the encoded section.
    pub fn finish(self) -> Bytes {
        self.writer.finish()
    }
}

/// Context handed to snapshot loaders; wraps the input stream and carries the
/// snapshot's reign for compatibility decisions.
#[derive(Debug)]
pub struct LoadContext<'a> {
    reader: WireReader<'a>,
    reign: Reign,
}

impl<'a> LoadContext<'a> {
    /// A context over raw section bytes saved at `reign`.
    pub fn new(section: &'a [u8], reign: Reign) -> Self {
        Self {
            reader: WireReader::new(section),
            reign,
        }
    }

    /// The underlying wire reader.
    pub fn reader(&mut self) -> &mut WireReader<'a> {
        &mut self.reader
    }

    /// The reign the snapshot was saved under.
    pub fn reign(&self) -> Reign {
        self.reign
    }
}

type Handler = Arc<dyn Fn(&Mutation) + Send + Sync>;
type Saver = Arc<dyn Fn(&mut SaveContext) + Send + Sync>;
type Loader = Arc<dyn Fn(&mut LoadContext<'_>) -> WireResult<()> + Send + Sync>;

/// A deterministic, in-process replicated state machine.
///
/// Mutations are applied in strict submission order on the automaton's serial
/// invoker; a leader and its followers feeding the same mutation sequence
/// reach the same state. A handler that panics would diverge the replicas, so
/// the process aborts.
pub struct LocalAutomaton {
    invoker: Arc<SerialInvoker>,
    handlers: Mutex<HashMap<String, Handler>>,
    savers: Mutex<Vec<(String, Saver)>>,
    loaders: Mutex<HashMap<String, Loader>>,
    applied_count: AtomicU64,
}

impl fmt::Debug for LocalAutomaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAutomaton")
            .field("invoker", &self.invoker)
            .field("applied_count", &self.applied_count)
            .finish()
    }
}

impl LocalAutomaton {
    /// Create an automaton draining onto `invoker`.
    pub fn new(invoker: Arc<SerialInvoker>) -> Arc<Self> {
        Arc::new(Self {
            invoker,
            handlers: Default::default(),
            savers: Default::default(),
            loaders: Default::default(),
            applied_count: AtomicU64::new(0),
        })
    }

    /// The serial invoker all state access must go through.
    pub fn invoker(&self) -> &Arc<SerialInvoker> {
        &self.invoker
    }

    /// Number of mutations applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied_count.load(Ordering::SeqCst)
    }

    /// Register the handler for `method`. Replaces any previous handler.
    pub fn register_method(
        &self,
        method: impl Into<String>,
        handler: impl Fn(&Mutation) + Send + Sync + 'static,
    ) {
        self.handlers.lock().insert(method.into(), Arc::new(handler));
    }

    /// Register a snapshot saver under `name`; savers run in registration
    /// order.
    pub fn register_saver(
        &self,
        name: impl Into<String>,
        saver: impl Fn(&mut SaveContext) + Send + Sync + 'static,
    ) {
        self.savers.lock().push((name.into(), Arc::new(saver)));
    }

    /// Register the loader for snapshot section `name`.
    pub fn register_loader(
        &self,
        name: impl Into<String>,
        loader: impl Fn(&mut LoadContext<'_>) -> WireResult<()> + Send + Sync + 'static,
    ) {
        self.loaders.lock().insert(name.into(), Arc::new(loader));
    }

    /// Submit a mutation. The future resolves once the mutation has been
    /// applied; submission order is apply order.
    pub fn commit_mutation(self: &Arc<Self>, mutation: Mutation) -> PromiseFuture<()> {
        let promise = Promise::new();
        let future = promise.future();

        if !mutation.reign.is_supported() {
            promise.set_error(AsyncError::Failed(
                Error::UnsupportedReign {
                    reign: mutation.reign,
                }
                .to_string(),
            ));
            return future;
        }
        let handler = match self.handlers.lock().get(&mutation.method) {
            Some(handler) => Arc::clone(handler),
            None => {
                promise.set_error(AsyncError::Failed(
                    Error::UnknownMethod {
                        method: mutation.method,
                    }
                    .to_string(),
                ));
                return future;
            }
        };

        let automaton = Arc::clone(self);
        self.invoker.invoke(Box::new(move || {
            debug!(method = %mutation.method, "applying mutation");
            // A throwing apply handler means replica state would diverge.
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&mutation)));
            if outcome.is_err() {
                error!(method = %mutation.method, "mutation handler panicked, aborting");
                std::process::abort();
            }
            automaton.applied_count.fetch_add(1, Ordering::SeqCst);
            promise.try_set(());
        }));
        future
    }

    /// Produce a snapshot of all registered components.
    ///
    /// Must be called from the automaton's execution context so that no
    /// mutation interleaves with the savers.
    pub fn save_snapshot(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer.write_u32(CURRENT_REIGN.0);

        let savers = self.savers.lock().clone();
        writer.write_u32(savers.len() as u32);
        for (name, saver) in savers {
            let mut context = SaveContext::default();
            saver(&mut context);
            writer.write_string(&name);
            writer.write_bytes(&context.writer.finish());
        }
        writer.finish()
    }

    /// Load a snapshot previously produced by [`LocalAutomaton::save_snapshot`].
    pub fn load_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let mut reader = WireReader::new(snapshot);
        let reign = Reign(
            reader
                .read_u32()
                .map_err(|source| Error::MalformedSnapshot { source })?,
        );
        if !reign.is_supported() {
            return UnsupportedReignSnafu { reign }.fail();
        }

        let section_count = reader
            .read_u32()
            .map_err(|source| Error::MalformedSnapshot { source })?;
        let loaders = self.loaders.lock().clone();
        for _ in 0..section_count {
            let name = reader
                .read_string()
                .map_err(|source| Error::MalformedSnapshot { source })?;
            let section = reader
                .read_bytes()
                .map_err(|source| Error::MalformedSnapshot { source })?;
            let loader = loaders
                .get(&name)
                .ok_or_else(|| Error::UnknownSnapshotSection { name: name.clone() })?;

            let mut context = LoadContext {
                reader: WireReader::new(&section),
                reign,
            };
            loader(&mut context)
                .and_then(|()| context.reader.expect_eof())
                .map_err(|source| Error::MalformedSnapshotSection {
                    name: name.clone(),
                    source,
                })?;
        }
        reader
            .expect_eof()
            .map_err(|source| Error::MalformedSnapshot { source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutations_apply_in_submission_order() {
        let automaton = LocalAutomaton::new(SerialInvoker::new("automaton"));
        let log = Arc::new(Mutex::new(Vec::new()));

        let captured = Arc::clone(&log);
        automaton.register_method("append", move |mutation| {
            let mut reader = WireReader::new(&mutation.payload);
            captured.lock().push(reader.read_u64().unwrap());
        });

        let mut last = None;
        for i in 0..50u64 {
            let mut writer = WireWriter::new();
            writer.write_u64(i);
            last = Some(automaton.commit_mutation(Mutation::new("append", writer.finish())));
        }
        last.unwrap().await.unwrap();

        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
        assert_eq!(automaton.applied_count(), 50);
    }

    #[tokio::test]
    async fn unknown_method_and_reign_are_rejected() {
        let automaton = LocalAutomaton::new(SerialInvoker::new("automaton"));

        let result = automaton
            .commit_mutation(Mutation::new("nope", Bytes::new()))
            .await;
        assert!(matches!(result, Err(AsyncError::Failed(message)) if message.contains("nope")));

        automaton.register_method("known", |_| {});
        let mut mutation = Mutation::new("known", Bytes::new());
        mutation.reign = Reign(CURRENT_REIGN.0 + 1);
        let result = automaton.commit_mutation(mutation).await;
        assert!(
            matches!(result, Err(AsyncError::Failed(message)) if message.contains("unsupported reign"))
        );
    }

    #[tokio::test]
    async fn snapshot_roundtrip_is_byte_stable() {
        let automaton = LocalAutomaton::new(SerialInvoker::new("automaton"));
        let state = Arc::new(Mutex::new(vec![3u64, 1, 4, 1, 5]));

        let captured = Arc::clone(&state);
        automaton.register_saver("test.values", move |context| {
            let values = captured.lock();
            context.writer().write_u32(values.len() as u32);
            for value in values.iter() {
                context.writer().write_u64(*value);
            }
        });
        let captured = Arc::clone(&state);
        automaton.register_loader("test.values", move |context| {
            let count = context.reader().read_u32()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(context.reader().read_u64()?);
            }
            *captured.lock() = values;
            Ok(())
        });

        let first = automaton.save_snapshot();
        state.lock().clear();
        automaton.load_snapshot(&first).unwrap();
        let second = automaton.save_snapshot();
        assert_eq!(first, second);
        assert_eq!(*state.lock(), vec![3, 1, 4, 1, 5]);
    }

    #[tokio::test]
    async fn snapshot_with_unknown_section_is_refused() {
        let producer = LocalAutomaton::new(SerialInvoker::new("producer"));
        producer.register_saver("only.here", |context| context.writer().write_u8(1));
        let snapshot = producer.save_snapshot();

        let consumer = LocalAutomaton::new(SerialInvoker::new("consumer"));
        assert!(matches!(
            consumer.load_snapshot(&snapshot),
            Err(Error::UnknownSnapshotSection { name }) if name == "only.here"
        ));
    }
}
