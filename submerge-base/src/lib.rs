mod change_vector;
mod error;
mod fault;
mod ids;
mod mutation_kind;

pub use change_vector::ChangeVector;
pub use error::{err, Error, Result};
pub use fault::Fault;
pub use ids::{DatabaseId, NodeTag};
pub use mutation_kind::MutationKind;
