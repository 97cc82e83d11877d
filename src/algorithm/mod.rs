//! Event construction/verification and the consensus engine built on top of
//! it, split into an event module and a datastructure module.

pub mod datastructure;
pub mod event;
