use crate::views::{App, ViewError, ViewStatus};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.attendant.Attendant1";
pub const OBJECT_PATH: &str = "/org/attendant/Attendant1";

/// D-Bus interface for the attendance capture daemon, served as
/// [`BUS_NAME`] at [`OBJECT_PATH`].
pub struct AttendantService {
    app: Arc<App>,
}

impl AttendantService {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }
}

fn to_fdo(e: ViewError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json(status: &ViewStatus) -> zbus::fdo::Result<String> {
    serde_json::to_string(status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.attendant.Attendant1")]
impl AttendantService {
    /// Open the student attendance view. Returns the view status as JSON.
    async fn open_attendance(&self) -> zbus::fdo::Result<String> {
        tracing::info!("open_attendance requested");
        let status = self.app.open_attendance().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Verify the face in front of the camera and mark attendance.
    async fn mark(&self, latitude: f64, longitude: f64) -> zbus::fdo::Result<String> {
        tracing::info!("mark requested");
        self.app.mark(latitude, longitude).await.map_err(to_fdo)
    }

    /// Open the face registration view.
    async fn open_enrollment(&self) -> zbus::fdo::Result<String> {
        tracing::info!("open_enrollment requested");
        let status = self.app.open_enrollment().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Take one registration sample. Returns the number collected.
    async fn capture(&self) -> zbus::fdo::Result<u32> {
        let count = self.app.capture().await.map_err(to_fdo)?;
        Ok(count as u32)
    }

    async fn reset_captures(&self) -> zbus::fdo::Result<()> {
        self.app.reset_captures().map_err(to_fdo)
    }

    /// Upload the registration samples.
    async fn submit(&self) -> zbus::fdo::Result<String> {
        tracing::info!("submit requested");
        self.app.submit().await.map_err(to_fdo)
    }

    /// Open the live report for a session.
    async fn open_report(&self, session_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "open_report requested");
        let status = self.app.open_report(session_id).await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// The host went to the background: release the camera, keep the view.
    async fn hide(&self) -> u32 {
        self.app.hide() as u32
    }

    async fn leave(&self) {
        self.app.leave();
    }

    /// Return the open view's status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let view = self.app.status();
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera_active": self.app.services().engine.camera().is_active(),
            "signed_out": self.app.services().server.is_signed_out(),
            "view": view,
        });
        Ok(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_name_matches_interface_and_path() {
        assert_eq!(OBJECT_PATH, format!("/{}", BUS_NAME.replace('.', "/")));
        assert!(zbus::names::WellKnownName::try_from(BUS_NAME).is_ok());
        assert!(zbus::zvariant::ObjectPath::try_from(OBJECT_PATH).is_ok());
    }
}
