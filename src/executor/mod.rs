pub mod action;
pub mod input;
pub mod keys;
pub mod launcher;
pub mod matcher;
