pub mod flavors;
pub mod run;
