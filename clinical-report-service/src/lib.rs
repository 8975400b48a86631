pub mod cache;
pub mod config;
pub mod error;
pub mod labs;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod rules;
pub mod services;
pub mod tasks;
pub mod workflow;

pub use cache::{FileSessionCache, InMemorySessionCache, SessionCache};
pub use config::{CdssConfig, PipelineKind, ServiceCredentials};
pub use error::{PipelineError, Result};
pub use labs::{LabValues, extract_lab_values};
pub use models::*;
pub use normalize::ExternalValue;
pub use pipeline::ClinicalPipeline;
pub use services::PipelineServices;
pub use workflow::{build_clinical_workflow, create_clinical_session};
