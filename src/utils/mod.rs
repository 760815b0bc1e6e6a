pub mod javascript;

pub use javascript::PageScripts;
