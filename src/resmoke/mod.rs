pub mod external_cmd;
pub mod resmoke_proxy;
pub mod resmoke_suite;
