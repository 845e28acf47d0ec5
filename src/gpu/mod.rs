// gpu/mod.rs -- wgpu backend of the correlation kernel.
//
// The CPU kernel in kernel::cpu stays the authoritative reference; the GPU
// kernel is validated against it score-for-score (to f32 tolerance).
//
// Division of work:
//
//   GPU   ZNCC of every (facet, deformation) pair of a loaded sub-task
//   CPU   splitting, best-of-slot reduction, displacement, strain
//
// The boundary is one readback of the score buffer per sub-task. Image
// buffers stay on the device for the whole solve; facet and limit buffers
// are rebuilt per sub-task.

pub mod device;
pub mod correlation;
