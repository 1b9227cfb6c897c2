//! Selection of the configured peripheral per role.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::config::{PeripheralConfig, PeripheralsConfiguration};
use crate::error::{PipelineError, Result};
use crate::fs_repo::FileRepository;
use crate::os::OsGateway;
use crate::peripheral::{
    ArduinoTurntable, BackgroundRemovalPeripheral, CameraPeripheral, ChromaKeyBackgroundRemoval,
    ExternalProgramBackgroundRemoval, ExternalProgramCamera, ExternalProgramModelCreator,
    ExternalProgramModelEditor, FallbackBackgroundRemoval, FallbackCamera, FallbackModelCreator,
    FallbackModelEditor, ManualTurntable, ModelCreatorPeripheral, ModelEditorPeripheral,
    Peripheral, PeripheralKind, PeripheralRole, PeripheralStatus, TurntablePeripheral,
};

/// Registered peripherals, kept in one collection per role.
///
/// Lookups are linear and uncached; the configured kind is resolved on every
/// call. At most one registered peripheral may support a given kind.
#[derive(Default)]
pub struct PeripheralRegistry {
    turntables: Vec<Arc<dyn TurntablePeripheral>>,
    cameras: Vec<Arc<dyn CameraPeripheral>>,
    background_removals: Vec<Arc<dyn BackgroundRemovalPeripheral>>,
    model_creators: Vec<Arc<dyn ModelCreatorPeripheral>>,
    model_editors: Vec<Arc<dyn ModelEditorPeripheral>>,
}

/// Status line for one role of a configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeripheralStatusEntry {
    pub role: PeripheralRole,
    pub kind: PeripheralKind,
    pub label: String,
    pub status: PeripheralStatus,
}

fn select<T>(candidates: &[Arc<T>], role: PeripheralRole, kind: PeripheralKind) -> Result<Arc<T>>
where
    T: Peripheral + ?Sized,
{
    candidates
        .iter()
        .find(|peripheral| peripheral.supports(kind))
        .cloned()
        .ok_or(PipelineError::PeripheralNotFound { role, kind })
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in peripheral.
    pub fn with_builtin(fs: Arc<dyn FileRepository>, os: Arc<dyn OsGateway>) -> Self {
        let mut registry = Self::new();
        registry
            .register_turntable(Arc::new(ArduinoTurntable::new()))
            .register_turntable(Arc::new(ManualTurntable::new()))
            .register_camera(Arc::new(ExternalProgramCamera::new(Arc::clone(&os))))
            .register_camera(Arc::new(FallbackCamera::new(Arc::clone(&fs))))
            .register_background_removal(Arc::new(ExternalProgramBackgroundRemoval::new(
                Arc::clone(&os),
            )))
            .register_background_removal(Arc::new(ChromaKeyBackgroundRemoval::new()))
            .register_background_removal(Arc::new(FallbackBackgroundRemoval::new()))
            .register_model_creator(Arc::new(ExternalProgramModelCreator::new(
                Arc::clone(&fs),
                Arc::clone(&os),
            )))
            .register_model_creator(Arc::new(FallbackModelCreator::new(fs)))
            .register_model_editor(Arc::new(ExternalProgramModelEditor::new(os)))
            .register_model_editor(Arc::new(FallbackModelEditor::new()));
        registry
    }

    pub fn register_turntable(&mut self, peripheral: Arc<dyn TurntablePeripheral>) -> &mut Self {
        self.turntables.push(peripheral);
        self
    }

    pub fn register_camera(&mut self, peripheral: Arc<dyn CameraPeripheral>) -> &mut Self {
        self.cameras.push(peripheral);
        self
    }

    pub fn register_background_removal(
        &mut self,
        peripheral: Arc<dyn BackgroundRemovalPeripheral>,
    ) -> &mut Self {
        self.background_removals.push(peripheral);
        self
    }

    pub fn register_model_creator(
        &mut self,
        peripheral: Arc<dyn ModelCreatorPeripheral>,
    ) -> &mut Self {
        self.model_creators.push(peripheral);
        self
    }

    pub fn register_model_editor(
        &mut self,
        peripheral: Arc<dyn ModelEditorPeripheral>,
    ) -> &mut Self {
        self.model_editors.push(peripheral);
        self
    }

    pub fn turntable(&self, config: &PeripheralConfig) -> Result<Arc<dyn TurntablePeripheral>> {
        select(&self.turntables, PeripheralRole::Turntable, config.kind)
    }

    pub fn camera(&self, config: &PeripheralConfig) -> Result<Arc<dyn CameraPeripheral>> {
        select(&self.cameras, PeripheralRole::Camera, config.kind)
    }

    pub fn background_removal(
        &self,
        config: &PeripheralConfig,
    ) -> Result<Arc<dyn BackgroundRemovalPeripheral>> {
        select(
            &self.background_removals,
            PeripheralRole::BackgroundRemoval,
            config.kind,
        )
    }

    pub fn model_creator(
        &self,
        config: &PeripheralConfig,
    ) -> Result<Arc<dyn ModelCreatorPeripheral>> {
        select(&self.model_creators, PeripheralRole::ModelCreator, config.kind)
    }

    pub fn model_editor(
        &self,
        config: &PeripheralConfig,
    ) -> Result<Arc<dyn ModelEditorPeripheral>> {
        select(&self.model_editors, PeripheralRole::ModelEditor, config.kind)
    }

    /// Resolves the peripheral configured for `role` as its base trait.
    fn peripheral_for(
        &self,
        role: PeripheralRole,
        config: &PeripheralConfig,
    ) -> Result<Arc<dyn Peripheral>> {
        Ok(match role {
            PeripheralRole::Turntable => self.turntable(config)? as Arc<dyn Peripheral>,
            PeripheralRole::Camera => self.camera(config)? as Arc<dyn Peripheral>,
            PeripheralRole::BackgroundRemoval => {
                self.background_removal(config)? as Arc<dyn Peripheral>
            }
            PeripheralRole::ModelCreator => self.model_creator(config)? as Arc<dyn Peripheral>,
            PeripheralRole::ModelEditor => self.model_editor(config)? as Arc<dyn Peripheral>,
        })
    }

    /// Status of every configured peripheral.
    pub async fn status_report(
        &self,
        configuration: &PeripheralsConfiguration,
    ) -> Vec<PeripheralStatusEntry> {
        let mut report = Vec::with_capacity(PeripheralRole::ALL.len());
        for role in PeripheralRole::ALL {
            let config = configuration.for_role(role);
            let status = match self.peripheral_for(role, config) {
                Ok(peripheral) => peripheral.status(config).await,
                Err(err) => {
                    debug!(%role, error = %err, "configured peripheral is not registered");
                    PeripheralStatus::NotConfigured
                }
            };
            report.push(PeripheralStatusEntry {
                role,
                kind: config.kind,
                label: config.label.clone(),
                status,
            });
        }
        report
    }

    /// Runs discovery on every registered peripheral concurrently.
    pub async fn scan(&self) -> Vec<PeripheralConfig> {
        let all: Vec<Arc<dyn Peripheral>> = self
            .turntables
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn Peripheral>)
            .chain(self.cameras.iter().map(|p| Arc::clone(p) as Arc<dyn Peripheral>))
            .chain(
                self.background_removals
                    .iter()
                    .map(|p| Arc::clone(p) as Arc<dyn Peripheral>),
            )
            .chain(
                self.model_creators
                    .iter()
                    .map(|p| Arc::clone(p) as Arc<dyn Peripheral>),
            )
            .chain(
                self.model_editors
                    .iter()
                    .map(|p| Arc::clone(p) as Arc<dyn Peripheral>),
            )
            .collect();

        join_all(all.iter().map(|peripheral| peripheral.scan()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

impl fmt::Debug for PeripheralRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralRegistry")
            .field(
                "turntables",
                &self.turntables.iter().map(|p| p.kind()).collect::<Vec<_>>(),
            )
            .field(
                "cameras",
                &self.cameras.iter().map(|p| p.kind()).collect::<Vec<_>>(),
            )
            .field(
                "background_removals",
                &self
                    .background_removals
                    .iter()
                    .map(|p| p.kind())
                    .collect::<Vec<_>>(),
            )
            .field(
                "model_creators",
                &self.model_creators.iter().map(|p| p.kind()).collect::<Vec<_>>(),
            )
            .field(
                "model_editors",
                &self.model_editors.iter().map(|p| p.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fs_repo::FilesystemFileRepository;
    use crate::os::MockOsGateway;

    fn registry() -> PeripheralRegistry {
        PeripheralRegistry::with_builtin(
            Arc::new(FilesystemFileRepository),
            Arc::new(MockOsGateway::new()),
        )
    }

    #[test]
    fn selects_peripheral_matching_configured_kind() {
        let registry = registry();
        let config = PeripheralConfig::fallback(PeripheralKind::ChromaKeyBackgroundRemoval);
        let remover = registry.background_removal(&config).unwrap();
        assert_eq!(remover.kind(), PeripheralKind::ChromaKeyBackgroundRemoval);

        let camera = registry
            .camera(&PeripheralConfig::fallback(PeripheralKind::FallbackCamera))
            .unwrap();
        assert_eq!(camera.kind(), PeripheralKind::FallbackCamera);
    }

    #[test]
    fn kind_of_another_role_is_a_configuration_error() {
        let registry = registry();
        let config = PeripheralConfig::fallback(PeripheralKind::ArduinoTurntable);
        let err = registry.camera(&config).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PeripheralNotFound {
                role: PeripheralRole::Camera,
                kind: PeripheralKind::ArduinoTurntable,
            }
        ));
        assert!(err.to_string().starts_with("Could not detect selected camera peripheral"));
    }

    #[test]
    fn empty_registry_matches_nothing() {
        let registry = PeripheralRegistry::new();
        let config = PeripheralConfig::fallback(PeripheralKind::FallbackModelEditor);
        assert!(registry.model_editor(&config).is_err());
    }

    #[tokio::test]
    async fn fallback_configuration_reports_available() {
        let report = registry()
            .status_report(&PeripheralsConfiguration::default())
            .await;
        assert_eq!(report.len(), 5);
        assert!(
            report
                .iter()
                .all(|entry| entry.status == PeripheralStatus::Available)
        );
    }

    #[tokio::test]
    async fn scan_collects_discovered_programs() {
        let mut os = MockOsGateway::new();
        os.expect_find_program().returning(|name| {
            (name == "gphoto2").then(|| std::path::PathBuf::from("/usr/bin/gphoto2"))
        });
        let registry =
            PeripheralRegistry::with_builtin(Arc::new(FilesystemFileRepository), Arc::new(os));

        let found = registry.scan().await;
        let cameras: Vec<_> = found
            .iter()
            .filter(|config| config.kind == PeripheralKind::ExternalProgramCamera)
            .collect();
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].command(), "/usr/bin/gphoto2");
    }
}
