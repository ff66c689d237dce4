use crate::engine::{EngineError, EngineHandle};
use crate::recognition::FrameReceiver;
use facereg_core::{RegistryError, VerdictView};
use zbus::interface;

/// D-Bus interface for the facereg daemon.
///
/// Bus name: org.facereg.Registry1
/// Object path: /org/facereg/Registry1
pub struct RegistryService {
    engine: EngineHandle,
    frames: FrameReceiver,
}

impl RegistryService {
    pub fn new(engine: EngineHandle, frames: FrameReceiver) -> Self {
        Self { engine, frames }
    }
}

pub const BUS_NAME: &str = "org.facereg.Registry1";
pub const OBJECT_PATH: &str = "/org/facereg/Registry1";

#[interface(name = "org.facereg.Registry1")]
impl RegistryService {
    /// Register a descriptor under `label`. Returns the label's set as JSON.
    async fn register_face(&self, label: &str, descriptor: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(label, dim = descriptor.len(), "register requested");
        let descriptor = descriptor.into_iter().map(|v| v as f32).collect();
        let set = self
            .engine
            .register(label.to_string(), descriptor)
            .await
            .map_err(to_fdo)?;
        to_json(&set)
    }

    /// Register the best face of the latest frame under `label`.
    async fn register_current_face(&self, label: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, "register current face requested");
        let detection = self
            .frames
            .best_detection()
            .ok_or_else(|| to_fdo(EngineError::NoFaceDetected))?;
        let set = self
            .engine
            .register(label.to_string(), detection.descriptor)
            .await
            .map_err(to_fdo)?;
        to_json(&set)
    }

    /// Classify a descriptor. Returns `{"label": ..., "distance": ...}`.
    async fn classify(&self, descriptor: Vec<f64>) -> zbus::fdo::Result<String> {
        let descriptor: Vec<f32> = descriptor.into_iter().map(|v| v as f32).collect();
        let verdict = self.engine.classify(&descriptor).map_err(to_fdo)?;
        tracing::debug!(label = verdict.label(), distance = verdict.distance(), "classified");
        to_json(&VerdictView::from(&verdict))
    }

    /// Persisted-shape JSON of every registered face.
    async fn export_all(&self) -> zbus::fdo::Result<String> {
        self.engine.export_all().await.map_err(to_fdo)
    }

    /// Remove every registered face.
    async fn clear_all(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear requested");
        self.engine.clear_all().await.map_err(to_fdo)
    }

    /// List labels with their descriptor counts.
    async fn list_labels(&self) -> zbus::fdo::Result<String> {
        let labels = self.engine.list_labels().await.map_err(to_fdo)?;
        to_json(&labels)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        let last_frame = self.frames.latest().map(|slot| slot.seq);
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "registry": status,
            "last_frame": last_frame,
        })
        .to_string())
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Registry(
            e @ (RegistryError::InvalidLabel | RegistryError::InvalidDescriptor(_)),
        ) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let invalid = to_fdo(EngineError::Registry(RegistryError::InvalidLabel));
        assert!(matches!(invalid, zbus::fdo::Error::InvalidArgs(_)));

        let no_face = to_fdo(EngineError::NoFaceDetected);
        match no_face {
            zbus::fdo::Error::Failed(msg) => assert_eq!(msg, "no face detected. Please try again."),
            other => panic!("unexpected {other:?}"),
        }
    }
}
