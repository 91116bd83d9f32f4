pub mod args;
pub mod headless;
