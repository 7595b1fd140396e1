#![deny(dead_code)]

pub mod basis;
pub mod construction;
pub mod estimate;
pub mod matrix;
pub mod pirls;
pub mod seeding;
pub mod types;
