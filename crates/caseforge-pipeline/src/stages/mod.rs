pub mod compliance_mapper;
pub mod document_parser;
pub mod finalizer;
pub mod quality_validator;
pub mod requirement_extractor;
pub mod test_generator;

pub use compliance_mapper::ComplianceMapper;
pub use document_parser::DocumentParser;
pub use finalizer::Finalizer;
pub use quality_validator::QualityValidator;
pub use requirement_extractor::RequirementExtractor;
pub use test_generator::TestGenerator;
