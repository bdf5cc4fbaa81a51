pub mod gateway;
pub mod locator;
pub mod parse;
pub mod runner;
