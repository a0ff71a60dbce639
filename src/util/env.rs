//! Process configuration, read once from the environment (and `.env`, if present).
//!
//! Deserialization goes through a small serde `Deserializer` over `(key, value)` pairs, modelled
//! on the [`envy`] crate but without its `rename` limitations.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::iter::{IntoIterator, empty};
use std::sync::LazyLock;

use serde::Deserialize;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{self, IntoDeserializer};
use thiserror::Error;
use tokio::sync::OnceCell;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);

pub async fn env() -> EnvResult<&'static Env> {
    ENV_VARS.get_or_try_init(|| async { Env::new() }).await
}

pub async fn get_var(var: Var) -> EnvResult<&'static str> {
    let vars = env().await?;
    let value = match var {
        Var::DatabaseUrl => vars.database_url.as_deref(),
        Var::IdentitySecret => Some(vars.identity_secret.as_str()),
        Var::ServerApiPort => Some(vars.server_api_port.as_str()),
        Var::CorsAllowOrigins => Some(vars.cors_allow_origins.as_str()),
        Var::OtelExporterEndpoint => vars.otel_exporter_otlp_endpoint.as_deref(),
        Var::ApiServiceName => Some(vars.api_service_name.as_str()),
        Var::ApiTracerName => Some(vars.api_tracer_name.as_str()),
        Var::LogFormat => Some(vars.log_format.as_str()),
    };

    value.ok_or(EnvErr::Unset(var))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    #[serde(default)]
    pub database_url: Option<String>,
    pub identity_secret: String,
    #[serde(default = "default_port")]
    pub server_api_port: String,
    #[serde(default = "default_cors")]
    pub cors_allow_origins: String,
    #[serde(default = "default_wager_amounts")]
    pub wager_amounts: Vec<i64>,
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub api_service_name: String,
    #[serde(default = "default_tracer_name")]
    pub api_tracer_name: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        let env = from_env::<Env>()?;
        env.validate()?;

        Ok(env)
    }

    fn validate(&self) -> EnvResult<()> {
        if self.wager_amounts.is_empty() {
            return Err(EnvErr::Invalid {
                name: "WAGER_AMOUNTS",
                reason: String::from("at least one amount is required"),
            });
        }

        if let Some(bad) = self.wager_amounts.iter().find(|amount| **amount <= 0) {
            return Err(EnvErr::Invalid {
                name: "WAGER_AMOUNTS",
                reason: format!("amounts must be positive, got {bad}"),
            });
        }

        Ok(())
    }
}

fn default_port() -> String {
    String::from("8080")
}

fn default_cors() -> String {
    String::from("*")
}

fn default_wager_amounts() -> Vec<i64> {
    vec![10, 20, 30]
}

fn default_service_name() -> String {
    String::from("pitchside-server")
}

fn default_tracer_name() -> String {
    String::from("pitchside-tracer")
}

fn default_log_format() -> String {
    String::from("pretty")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    DatabaseUrl,
    IdentitySecret,
    ServerApiPort,
    CorsAllowOrigins,
    OtelExporterEndpoint,
    ApiServiceName,
    ApiTracerName,
    LogFormat,
}

#[macro_export]
macro_rules! var {
    ($ev:expr) => {
        $crate::util::env::get_var($ev)
    };
}

// ---
//  Deserializer implementation
// ---

/// `(variable name, raw value)`; the name is kept for parse errors
struct Val(String, String);

struct Deserializer<'de, Iter: Iterator<Item = (String, String)>> {
    inner: MapDeserializer<'de, Vars<Iter>, EnvDeserializeError>,
}

struct Vars<Iter>
where
    Iter: IntoIterator<Item = (String, String)>,
{
    inner: Iter,
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<Iter: Iterator<Item = (String, String)>> Iterator for Vars<Iter> {
    type Item = (String, Val);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k.clone(), Val(k, v)))
    }
}

/// Only what `Env` needs: strings, optional strings and lists of integers
impl<'de> serde::de::Deserializer<'de> for Val {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.1.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_i64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self.1.parse::<i64>() {
            Ok(val) => visitor.visit_i64(val),
            Err(e) => Err(de::Error::custom(format_args!(
                "{e}: while parsing '{}' (provider: {})",
                self.1, self.0
            ))),
        }
    }

    /// Comma-separated lists, e.g. `WAGER_AMOUNTS=10,20,30`
    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.is_empty() {
            SeqDeserializer::new(empty::<Val>()).deserialize_seq(visitor)
        } else {
            let values = self
                .1
                .split(',')
                .map(|v| Val(self.0.clone(), v.trim().to_owned()));
            SeqDeserializer::new(values).deserialize_seq(visitor)
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 u8 u16 u32 u64 f32 f64
        char str string unit bytes byte_buf map enum
        unit_struct newtype_struct tuple_struct identifier tuple
        ignored_any struct
    }
}

impl<'de, Iter: Iterator<Item = (String, String)>> Deserializer<'de, Iter> {
    fn new(vars: Iter) -> Self {
        Deserializer {
            inner: MapDeserializer::new(Vars { inner: vars }),
        }
    }
}

impl<'de, Iter: Iterator<Item = (String, String)>> serde::de::Deserializer<'de>
    for Deserializer<'de, Iter>
{
    type Error = EnvDeserializeError;
    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self.inner)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf
        newtype_struct unit_struct tuple_struct identifier
        tuple ignored_any bool u8 u16 u32 u64 i8 i16 i32 i64
        f32 f64 enum struct
    }
}

pub fn from_env<T>() -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
{
    // `.env` is optional; a missing file just means everything comes from the process env
    _ = dotenvy::dotenv();
    from_iter(std::env::vars())
}

pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    T::deserialize(Deserializer::new(iter.into_iter()))
}

impl serde::de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.into())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),

    #[error("environment variable for {0:?} is not set")]
    Unset(Var),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing required environment variable: {0}")]
    MissingValue(String),
}
