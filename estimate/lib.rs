// Estimation stages. Every function here is a pure function of its inputs;
// caching and orchestration live in `crate::pipeline`.

pub mod color_law;
pub mod embedding;
pub mod gp;
pub mod maximum;
pub mod optimize;
pub mod phase;
pub mod rbtl;
