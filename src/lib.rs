pub mod data;
pub mod loss;
pub mod masks;
pub mod model;
pub mod training;
pub mod utils;
