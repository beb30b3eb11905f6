pub mod defer;
pub mod futures;
