pub mod file;
pub mod paths;

pub use file::{safe_folder_name, FileManager};
