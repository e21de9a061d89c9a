/*
[INPUT]:  HTTP submodules (client, endpoints, errors)
[OUTPUT]: Organized HTTP API exports
[POS]:    HTTP layer - module organization
[UPDATE]: When adding new endpoint groups
*/

pub mod account;
pub mod client;
pub mod error;
pub mod market;
pub mod trade;
