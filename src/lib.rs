mod app;

pub mod camera;
pub mod config;
pub mod detection;
pub mod detector;
pub mod follower;
pub mod frame;
pub mod link;
pub mod policy;
pub mod viewer;

pub use app::start_app;
