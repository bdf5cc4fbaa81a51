pub mod launch;
pub mod supervisor;
