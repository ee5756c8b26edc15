//! Task descriptors and the catalog that produces them.

mod catalog;
mod descriptor;

pub use catalog::{Catalog, CatalogSummary, RejectedRow};
pub use descriptor::{BoundingBox, DescriptorError, ResamplingMethod, TaskDescriptor};
