//! rollcall-core: Face detection, recognition and attendance bookkeeping.
//!
//! SCRFD detection and ArcFace recognition run via ONNX Runtime. Enrolled
//! identities live in immutable tables handed to camera pipelines through a
//! latest-wins channel; the cooldown ledger decides which matches become
//! attendance events.

pub mod alignment;
pub mod cooldown;
pub mod detector;
pub mod enrollment;
pub mod handoff;
pub mod recognizer;
pub mod sink;
pub mod types;

pub use cooldown::{Claim, CooldownLedger, Decision, DedupKey, DedupScope};
pub use detector::{DetectFaces, DetectorError, FaceDetector};
pub use enrollment::{build_table, fingerprint, EnrollmentError, Fingerprint};
pub use handoff::{table_channel, TablePublisher, TableSubscriber};
pub use recognizer::{ExtractEmbedding, FaceRecognizer, RecognizerError};
pub use sink::{AttendanceEvent, Delivery, EventSink, Notification, Notifier, NotifyError, SinkError};
pub use types::{BoundingBox, CosineMatcher, Embedding, Identity, IdentityMatch, IdentityTable, Matcher, RgbView};
