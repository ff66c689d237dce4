use facereg_core::{
    classify_with, Descriptor, FaceMatcher, FaceRegistry, LabeledDescriptorSet, MatchStrategy,
    RegistryError, Verdict,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no face detected. Please try again.")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Published matcher snapshot; `None` while nothing is registered.
pub type MatcherSnapshot = Option<Arc<FaceMatcher>>;

/// One entry of the label listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LabelSummary {
    pub label: String,
    pub descriptors: usize,
}

/// Registry status for the `Status` call.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub labels: usize,
    pub descriptors: usize,
    pub threshold: f32,
    pub strategy: MatchStrategy,
    pub descriptor_dim: usize,
    pub storage: &'static str,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Register {
        label: String,
        descriptor: Descriptor,
        reply: oneshot::Sender<Result<LabeledDescriptorSet, RegistryError>>,
    },
    Export {
        reply: oneshot::Sender<Result<String, RegistryError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    List {
        reply: oneshot::Sender<Vec<LabelSummary>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Mutations and exports go through the engine one at a time. `classify`
/// reads the latest published matcher directly and never waits on the
/// engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    matcher: watch::Receiver<MatcherSnapshot>,
    descriptor_dim: usize,
}

impl EngineHandle {
    /// Register `descriptor` under `label`. The new matcher is visible to
    /// `classify` by the time this returns.
    pub async fn register(
        &self,
        label: String,
        descriptor: Descriptor,
    ) -> Result<LabeledDescriptorSet, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Register {
            label,
            descriptor,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn export_all(&self) -> Result<String, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Export { reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn clear_all(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Clear { reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn list_labels(&self) -> Result<Vec<LabelSummary>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::List { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Status { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Classify against the latest published matcher.
    pub fn classify(&self, descriptor: &[f32]) -> Result<Verdict, EngineError> {
        let snapshot = self.snapshot();
        Ok(classify_with(
            snapshot.as_deref(),
            descriptor,
            self.descriptor_dim,
        )?)
    }

    /// The latest published matcher.
    pub fn snapshot(&self) -> MatcherSnapshot {
        self.matcher.borrow().clone()
    }

    pub fn descriptor_dim(&self) -> usize {
        self.descriptor_dim
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the registry engine on a dedicated OS thread.
pub fn spawn_engine(mut registry: FaceRegistry) -> Result<EngineHandle, EngineError> {
    let descriptor_dim = registry.config().descriptor_dim;

    let (matcher_tx, matcher_rx) = watch::channel(registry.matcher());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facereg-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&mut registry, &matcher_tx, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        matcher: matcher_rx,
        descriptor_dim,
    })
}

fn handle_request(
    registry: &mut FaceRegistry,
    matcher_tx: &watch::Sender<MatcherSnapshot>,
    req: EngineRequest,
) {
    match req {
        EngineRequest::Register {
            label,
            descriptor,
            reply,
        } => {
            let result = registry.register_face(&label, descriptor);
            if result.is_ok() {
                // Publish before replying so the caller's next classify
                // sees the new snapshot.
                matcher_tx.send_replace(registry.matcher());
            }
            let _ = reply.send(result);
        }
        EngineRequest::Export { reply } => {
            let _ = reply.send(registry.export_all());
        }
        EngineRequest::Clear { reply } => {
            let result = registry.clear_all();
            if result.is_ok() {
                matcher_tx.send_replace(None);
            }
            let _ = reply.send(result);
        }
        EngineRequest::List { reply } => {
            let labels = registry
                .store()
                .iter()
                .map(|set| LabelSummary {
                    label: set.label.clone(),
                    descriptors: set.descriptors.len(),
                })
                .collect();
            let _ = reply.send(labels);
        }
        EngineRequest::Status { reply } => {
            let config = registry.config();
            let _ = reply.send(EngineStatus {
                labels: registry.store().len(),
                descriptors: registry.store().descriptor_count(),
                threshold: config.threshold,
                strategy: config.strategy,
                descriptor_dim: config.descriptor_dim,
                storage: registry.storage_name(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facereg_core::{MemoryStorage, RegistryConfig, Storage, DEFAULT_STORAGE_KEY};

    const DIM: usize = 3;

    fn engine() -> (MemoryStorage, EngineHandle) {
        let storage = MemoryStorage::new();
        let config = RegistryConfig {
            descriptor_dim: DIM,
            ..RegistryConfig::default()
        };
        let registry = FaceRegistry::open(Box::new(storage.clone()), config).unwrap();
        (storage, spawn_engine(registry).unwrap())
    }

    #[tokio::test]
    async fn test_register_then_classify_sees_new_matcher() {
        let (_, handle) = engine();
        assert_eq!(handle.classify(&[0.0; DIM]).unwrap(), Verdict::unknown());

        handle.register("Alice".into(), vec![0.1, 0.2, 0.3]).await.unwrap();
        let verdict = handle.classify(&[0.1, 0.2, 0.3]).unwrap();
        assert_eq!(verdict, Verdict::Match { label: "Alice".into(), distance: 0.0 });
    }

    #[tokio::test]
    async fn test_invalid_label_is_reported() {
        let (_, handle) = engine();
        let err = handle.register("  ".into(), vec![0.0; DIM]).await.unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::InvalidLabel)));
        assert!(handle.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_clear_unpublishes_matcher() {
        let (storage, handle) = engine();
        handle.register("Alice".into(), vec![0.0; DIM]).await.unwrap();
        assert!(handle.snapshot().is_some());

        handle.clear_all().await.unwrap();
        handle.clear_all().await.unwrap();
        assert!(handle.snapshot().is_none());
        assert!(storage.get(DEFAULT_STORAGE_KEY).unwrap().is_none());
        assert_eq!(handle.classify(&[0.0; DIM]).unwrap(), Verdict::unknown());
    }

    #[tokio::test]
    async fn test_list_and_status() {
        let (_, handle) = engine();
        handle.register("Alice".into(), vec![0.0; DIM]).await.unwrap();
        handle.register("Bob".into(), vec![1.0; DIM]).await.unwrap();
        handle.register("Alice".into(), vec![0.5; DIM]).await.unwrap();

        let labels = handle.list_labels().await.unwrap();
        assert_eq!(
            labels,
            vec![
                LabelSummary { label: "Alice".into(), descriptors: 2 },
                LabelSummary { label: "Bob".into(), descriptors: 1 },
            ]
        );

        let status = handle.status().await.unwrap();
        assert_eq!(status.labels, 2);
        assert_eq!(status.descriptors, 3);
        assert_eq!(status.storage, "memory");
    }

    #[tokio::test]
    async fn test_concurrent_registrations_are_serialized() {
        let (storage, handle) = engine();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.register(format!("person-{}", i % 3), vec![i as f32; DIM]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let exported = handle.export_all().await.unwrap();
        assert_eq!(Some(exported), storage.get(DEFAULT_STORAGE_KEY).unwrap());
        let labels = handle.list_labels().await.unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.iter().map(|l| l.descriptors).sum::<usize>(), 8);
    }
}
