pub mod context;
pub mod fragment;
pub mod outline;
pub mod prune;
pub mod selectors;

pub use context::{PageContext, PageContextBuilder};
pub use fragment::{DomFragment, FragmentResult, FragmentService};
pub use outline::OutlineBuilder;
pub use selectors::{HandAuthoredNames, Landmark, NameHeuristic, SelectorSynthesizer};
