pub mod admission;
pub mod broadcast;
pub mod fanout;
pub mod identity;
pub mod outcome;
pub mod queue;
pub mod recorder;
pub mod vote;
