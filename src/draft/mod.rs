mod record;
mod stage;

pub use record::{
    ComposedDraft, Diagnostics, Draft, FinalArticle, PendingStep, RevisedDraft, SourceItem,
    Validation,
};
pub use stage::{PROCESSABLE, Stage};

#[cfg(test)]
pub(crate) use record::tests::sample_source;
