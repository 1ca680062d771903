pub mod conversion;
pub mod v1;
pub mod v1alpha1;
pub mod v1beta1;

pub use conversion::merged_crd;
// v1 is the storage version; the controller operates on it exclusively.
pub use v1::*;
