//! MySQL replay: one connection per session, one statement per task.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, Executor};

use apiary_engine::adapter::{AdapterFactory, ProtocolAdapter};
use apiary_engine::telemetry::Telemetry;

#[derive(Debug, Clone)]
pub struct MysqlOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl Default for MysqlOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "guest".to_string(),
            password: String::new(),
            database: "test".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

static TABLE_DNE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)table '[^']*' doesn't exist").expect("table regex must be valid")
});

/// Collapses the error classes seen in bulk during replay (duplicate keys,
/// syntax errors against renamed schemas, missing tables) so the stats table
/// stays readable.
fn classify(message: &str) -> String {
    if message.contains("Duplicate entry") {
        "(1062, \"Duplicate entry for key\")".to_string()
    } else if message.contains("You have an error in your SQL syntax") {
        "(1064, \"You have an error in your SQL syntax\")".to_string()
    } else if TABLE_DNE_RE.is_match(message) {
        "(1146, \"Table ___ doesn't exist\")".to_string()
    } else {
        message.to_string()
    }
}

pub struct MysqlFactory {
    options: Arc<MysqlOptions>,
}

impl MysqlFactory {
    pub fn new(options: MysqlOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }
}

impl AdapterFactory for MysqlFactory {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn build(&self, telemetry: Telemetry) -> Box<dyn ProtocolAdapter> {
        Box::new(MysqlAdapter {
            options: self.options.clone(),
            telemetry,
            connection: None,
        })
    }
}

struct MysqlAdapter {
    options: Arc<MysqlOptions>,
    telemetry: Telemetry,
    connection: Option<MySqlConnection>,
}

#[async_trait]
impl ProtocolAdapter for MysqlAdapter {
    async fn start_job(&mut self, _job_id: &str) {
        let connect = MySqlConnectOptions::new()
            .host(&self.options.host)
            .port(self.options.port)
            .username(&self.options.user)
            .password(&self.options.password)
            .database(&self.options.database);
        match tokio::time::timeout(self.options.connect_timeout, connect.connect()).await {
            Ok(Ok(connection)) => self.connection = Some(connection),
            Ok(Err(err)) => {
                self.telemetry.error(classify(&err.to_string()));
                self.connection = None;
            }
            Err(_) => {
                self.telemetry.error("timed out while connecting");
                self.connection = None;
            }
        }
    }

    async fn send_request(&mut self, request: &[u8]) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        let query = match std::str::from_utf8(request) {
            Ok(query) => query.trim(),
            Err(_) => {
                self.telemetry.error("query is not valid utf-8");
                return false;
            }
        };
        // Older capture pipelines leak the quit marker into the body.
        if query.is_empty() || query == "Quit" {
            return true;
        }

        let outcome = connection.execute(query).await;
        match outcome {
            Ok(_) => true,
            Err(err) => {
                self.telemetry.error(classify(&err.to_string()));
                self.connection = None;
                false
            }
        }
    }

    async fn finish_job(&mut self, _job_id: &str) {
        if let Some(mut connection) = self.connection.take() {
            // pt-query-digest sometimes neglects to record the commit.
            let _ = connection.execute("COMMIT").await;
            let _ = connection.close().await;
        }
    }
}
