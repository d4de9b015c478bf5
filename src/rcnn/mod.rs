pub mod bbox;
pub mod minibatch;
pub mod roidb;
