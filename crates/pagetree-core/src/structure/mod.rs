//! Flat-structure phases: source selection, extraction, mapping and
//! verification, plus the canonical structure-code synthesiser they share.

pub mod codes;
pub mod detect;
pub mod extract;
pub mod map;
pub mod verify;

pub use codes::CodeSynthesizer;
pub use detect::{TocSource, TocSourceDetector};
pub use extract::StructureExtractor;
pub use map::PageMapper;
pub use verify::{VerificationOutcome, Verifier};
