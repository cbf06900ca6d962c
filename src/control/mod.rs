mod controller;

pub use controller::RunController;
