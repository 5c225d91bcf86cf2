mod app;
mod duplicates;
mod records;
mod stats;

pub use app::{app, AppState};
