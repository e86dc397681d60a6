//! Application state shared across handlers

use common::media::TranscodeJob;
use common::queue::JobQueue;
use common::settings::Settings;
use common::storage::ObjectStorage;
use std::sync::Arc;

use crate::repositories::PoiRepository;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn ObjectStorage>,
    pub pois: Arc<dyn PoiRepository>,
    pub queue: JobQueue<TranscodeJob>,
    pub settings: Arc<Settings>,
}
