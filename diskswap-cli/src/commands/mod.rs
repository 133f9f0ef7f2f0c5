pub mod backups;
pub mod cache;
pub mod devices;
pub mod run;
pub mod status;
pub mod system;
