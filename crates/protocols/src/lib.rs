//! Protocol adapters: the pluggable drivers that turn captured request bytes
//! into live traffic. Adapters are compiled in and selected by name through
//! the registry.

pub mod countdb;
pub mod http;
pub mod mysql;

use std::sync::Arc;

use apiary_engine::adapter::AdapterRegistry;

/// Connection settings for every compiled-in adapter, typically populated
/// from the CLI's per-protocol option groups.
#[derive(Debug, Clone, Default)]
pub struct ProtocolOptions {
    pub http: http::HttpOptions,
    pub mysql: mysql::MysqlOptions,
    pub countdb: countdb::CountDbOptions,
    pub test: test::TestOptions,
}

/// Builds the registry of every compiled-in adapter.
pub fn default_registry(options: ProtocolOptions) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(http::HttpFactory::new(options.http)));
    registry.register(Arc::new(mysql::MysqlFactory::new(options.mysql)));
    registry.register(Arc::new(countdb::CountDbFactory::new(options.countdb)));
    registry.register(Arc::new(test::TestFactory::new(options.test)));
    registry
}
