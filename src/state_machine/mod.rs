pub mod runtime_sm;
