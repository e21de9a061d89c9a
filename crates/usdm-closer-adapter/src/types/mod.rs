/*
[INPUT]:  Type definitions from submodules
[OUTPUT]: Organized type exports
[POS]:    Type layer - module organization
[UPDATE]: When adding new type modules
*/

pub mod enums;
pub mod models;
