pub mod consumption_archive;
pub mod lib_smartmeter;
