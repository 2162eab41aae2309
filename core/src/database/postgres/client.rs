use std::{env, time::Duration};

use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use dotenv::dotenv;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::{task, time::timeout};
use tokio_postgres::{config::SslMode, Config};
use tracing::{error, info};

pub type PostgresConnectionManagerTls = PostgresConnectionManager<MakeTlsConnector>;

pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Connection pool runtime error: {0}")]
    ConnectionPoolRuntimeError(#[from] RunError<tokio_postgres::Error>),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,

    #[error("Pool size must be greater than 0")]
    PoolSizeZero,
}

/// How to reach the database and how many connections to keep.
#[derive(Debug, Clone)]
pub struct PostgresClientOptions {
    /// Falls back to `DATABASE_URL` when unset.
    pub url: Option<String>,
    pub pool_size: u32,
    pub connect_timeout: Duration,
}

impl Default for PostgresClientOptions {
    fn default() -> Self {
        PostgresClientOptions {
            url: None,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub struct PostgresClient {
    pool: Pool<PostgresConnectionManagerTls>,
    pool_size: u32,
}

impl PostgresClient {
    pub async fn new(options: PostgresClientOptions) -> Result<Self, PostgresConnectionError> {
        async fn _new(
            options: &PostgresClientOptions,
            disable_ssl: bool,
        ) -> Result<PostgresClient, PostgresConnectionError> {
            let connection_str = match &options.url {
                Some(url) => url.clone(),
                None => connection_string()?,
            };
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            // Perform a direct connection test
            let (client, connection) =
                match timeout(options.connect_timeout, config.connect(tls_connector.clone())).await {
                    Ok(Ok((client, connection))) => (client, connection),
                    Ok(Err(e)) => {
                        // retry without ssl if ssl has been attempted and failed
                        if !disable_ssl &&
                            config.get_ssl_mode() != SslMode::Disable &&
                            !connection_str.contains("sslmode=require")
                        {
                            return Box::pin(_new(options, true)).await;
                        }
                        error!("Error connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    Err(e) => {
                        error!("Timeout connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                };

            let connection_handle = task::spawn(connection);

            // Perform a simple query to check the connection
            if client.query_one("SELECT 1", &[]).await.is_err() {
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }

            // Drop the client and ensure the connection handle completes
            drop(client);
            match connection_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(_)) | Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            }

            let manager = PostgresConnectionManager::new(config, tls_connector);

            let pool = Pool::builder()
                .max_size(options.pool_size)
                .connection_timeout(options.connect_timeout)
                .build(manager)
                .await?;

            info!("Connected to postgres with a pool of {} connections", options.pool_size);

            Ok(PostgresClient { pool, pool_size: options.pool_size })
        }

        if options.pool_size == 0 {
            return Err(PostgresConnectionError::PoolSizeZero);
        }

        _new(&options, false).await
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    /// Checks a connection out of the pool for exclusive use by one operation.
    pub async fn get_owned(
        &self,
    ) -> Result<PooledConnection<'static, PostgresConnectionManagerTls>, RunError<tokio_postgres::Error>>
    {
        self.pool.get_owned().await
    }
}
