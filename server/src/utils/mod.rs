pub mod cancel;
pub mod canonical;
pub mod json_path;
