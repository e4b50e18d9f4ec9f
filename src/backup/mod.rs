pub mod adapter;
pub mod archive;
pub mod backup_config;
pub mod notifications;
pub mod orchestrator;
pub mod process;
pub mod redacted;
pub mod registry;
pub mod remote;
pub mod result_error;
pub mod retention;
pub mod run_result;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
