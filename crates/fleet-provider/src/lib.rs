// fleet-provider: compute adapter for the VM fleet. The `ComputeProvider`
// trait is the seam the reconciler drives; `OpenStackCompute` is the
// production implementation against an OpenStack-compatible compute API.

pub mod compute;
pub mod openstack;

pub use compute::{ComputeProvider, ServerStatus, ServerSummary};
pub use openstack::OpenStackCompute;
