//! Detection Gateway
//!
//! Accepts image uploads over HTTP, holds them in a transient on-disk store,
//! forwards them to an external inference service and returns its
//! predictions in a normalized shape.
//!
//! ## Detection flow
//!
//! ```text
//!  POST /detect          Transient Store             Inference Service
//! ┌──────────────┐      ┌──────────────┐           ┌──────────────┐
//! │ Upload       │─put─▶│ uploads/     │           │ POST /predict│
//! │ Intake       │      │  {ts}-{id}-  │──stream──▶│  field: file │
//! └──────────────┘      │  {name}      │           └──────────────┘
//!        │              └──────────────┘                  │
//!        ▼                     ▲                          ▼
//! ┌──────────────┐             │                   ┌──────────────┐
//! │ Detector     │──release────┘                   │ predictions  │
//! │ (guarded)    │◀────────────────────────────────│ movie→title  │
//! └──────────────┘                                 └──────────────┘
//! ```
//!
//! The uploaded file is removed before the response is sent, whatever the
//! outcome of the inference call.

pub mod api;
pub mod config;
pub mod detector;
pub mod file_store;
pub mod inference_client;
pub mod upload_intake;

pub use api::{create_router, start_api_server, AppState};
pub use config::{ConfigError, GatewayConfig};
pub use detector::{DetectError, Detector, StoredFileGuard};
pub use file_store::{FileStore, StoreError, StoredFile};
pub use inference_client::{
    DetectionResult, InferenceClient, InferenceError, Prediction, Predictor,
};
pub use upload_intake::{IntakeError, UploadIntake};
