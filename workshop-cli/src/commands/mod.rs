pub mod relay;
pub mod run;
pub mod settings;
