pub mod analytics;
pub mod extension_alerts;
pub mod realtime;
