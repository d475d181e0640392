//! Service layer
//!
//! Business logic between the HTTP handlers and storage/federation:
//! post submission, moderation, reports and bans, captchas and local actors.

mod actors;
mod captcha;
mod moderation;
pub mod options;
mod submission;
pub mod tripcode;

pub use actors::{ActorService, NewBoard, generate_keypair};
pub use captcha::{Captcha, CaptchaStore};
pub use moderation::ModerationService;
pub use options::PostOptions;
pub use submission::{Attachment, PosterInfo, Submission, SubmissionPipeline, Submitted};
