//! Session correlation: dissector rows in, versioned sessions and timeline out.

pub mod correlator;
pub mod field_extractor;
pub mod rules;
pub mod types;

pub use correlator::{Correlation, Correlator, PacketRecord};
pub use field_extractor::{ExtractionOptions, FieldExtractor};
pub use rules::{RuleFlag, RULES_VERSION};
pub use types::{AnalysisArtifact, Session, TimelineEvent, SCHEMA_VERSION};
