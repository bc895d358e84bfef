pub mod expand;
pub mod finalize;
pub mod list;
pub mod run;
pub mod status;
