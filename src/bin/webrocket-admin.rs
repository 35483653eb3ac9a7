//! The admin command-line tool.
//!
//! Wraps the admin HTTP surface. Success prints the affected resource as
//! plain lines; any failure prints the server's message to stderr and
//! exits 1. Responses are untyped JSON and every field is checked on the
//! way in - a missing or mistyped field is an invalid response, never a
//! panic.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reqwest::header::HeaderValue;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use webrocket::config::DEFAULT_STORAGE_DIR;
use webrocket::context::{default_node_name, read_cookie};

const COOKIE_HEADER: &str = "X-WebRocket-Cookie";

#[derive(Debug, Parser)]
#[command(name = "webrocket-admin", version, about = "WebRocket admin tool")]
struct Args {
    /// Address of the server's admin interface.
    #[arg(long, default_value = "127.0.0.1:8082")]
    admin_addr: String,

    /// Cookie string generated by the server. Defaults to the node's
    /// cookie file under the storage dir.
    #[arg(long)]
    cookie: Option<String>,

    /// Name of the node.
    #[arg(long)]
    node: Option<String>,

    /// Path to the broker's internal data store.
    #[arg(long, default_value = DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Shows list of the registered vhosts.
    #[command(name = "list_vhosts")]
    ListVhosts,

    /// Registers new vhost.
    #[command(name = "add_vhost")]
    AddVhost { path: String },

    /// Removes specified vhost.
    #[command(name = "delete_vhost")]
    DeleteVhost { path: String },

    /// Shows information about the specified vhost.
    #[command(name = "show_vhost")]
    ShowVhost { path: String },

    /// Removes all vhosts.
    #[command(name = "clear_vhosts")]
    ClearVhosts,

    /// Generates new access token for the specified vhost.
    #[command(name = "regenerate_vhost_token")]
    RegenerateVhostToken { path: String },

    /// Shows list of channels opened under given vhost.
    #[command(name = "list_channels")]
    ListChannels { vhost: String },

    /// Opens new channel under given vhost.
    #[command(name = "add_channel")]
    AddChannel { vhost: String, name: String },

    /// Removes channel from the specified vhost.
    #[command(name = "delete_channel")]
    DeleteChannel { vhost: String, name: String },

    /// Removes all channels from the specified vhost.
    #[command(name = "clear_channels")]
    ClearChannels { vhost: String },

    /// Shows list of the backend workers connected to the specified vhost.
    #[command(name = "list_workers")]
    ListWorkers { vhost: String },
}

/// Typed view of a vhost entry.
struct VhostInfo {
    path: String,
    access_token: String,
}

/// Typed view of a channel entry.
struct ChannelInfo {
    name: String,
    subscribers_size: u64,
}

fn maybe_vhost(value: &Value) -> Option<VhostInfo> {
    let data = value.as_object()?;
    Some(VhostInfo {
        path: data.get("path")?.as_str()?.to_string(),
        access_token: data.get("accessToken")?.as_str()?.to_string(),
    })
}

fn maybe_channel(value: &Value) -> Option<ChannelInfo> {
    let data = value.as_object()?;
    let subscribers_size = data
        .get("subscribers")
        .and_then(|s| s.get("size"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(ChannelInfo {
        name: data.get("name")?.as_str()?.to_string(),
        subscribers_size,
    })
}

fn maybe_worker(value: &Value) -> Option<String> {
    Some(value.as_object()?.get("id")?.as_str()?.to_string())
}

struct Admin {
    base: String,
    cookie: String,
    client: reqwest::Client,
}

impl Admin {
    /// Perform a request and extract the given namespace from the reply.
    ///
    /// Redirects are followed by hand with a fresh GET carrying the cookie,
    /// so mutating requests land on the resource view they point at.
    async fn request(
        &self,
        method: Method,
        path: &str,
        namespace: &str,
    ) -> Result<Value, String> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let url = format!("http://{}{}", self.base, path);
        let cookie = HeaderValue::from_str(&self.cookie)
            .map_err(|_| "invalid cookie string".to_string())?;
        let send_failed = |_| "couldn't perform the operation, is server running?".to_string();
        let mut response = self
            .client
            .request(method, &url)
            .header(COOKIE_HEADER, cookie.clone())
            .send()
            .await
            .map_err(send_failed)?;
        if response.status() == StatusCode::FOUND {
            if let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
            {
                let url = format!("http://{}{}", self.base, location);
                response = self
                    .client
                    .get(&url)
                    .header(COOKIE_HEADER, cookie)
                    .send()
                    .await
                    .map_err(send_failed)?;
            }
        }

        let code = response.status();
        let body: Option<Value> = response.json().await.ok();
        if code.is_success() || code == StatusCode::FOUND {
            if namespace.is_empty() {
                return Ok(Value::Null);
            }
            if let Some(data) = body.as_ref().and_then(|b| b.get(namespace)) {
                return Ok(data.clone());
            }
        }
        if let Some(message) = body
            .as_ref()
            .and_then(|b| b.get("error"))
            .and_then(Value::as_str)
        {
            return Err(message.to_string());
        }
        Err("couldn't perform the operation, invalid response!".to_string())
    }

    async fn run(&self, command: Command) -> Result<(), String> {
        match command {
            Command::ListVhosts => {
                let data = self.request(Method::GET, "/", "vhosts").await?;
                let entries = data.as_array().ok_or("invalid response")?;
                let mut paths: Vec<String> = entries
                    .iter()
                    .filter_map(maybe_vhost)
                    .map(|v| v.path)
                    .collect();
                paths.sort();
                for path in paths {
                    println!("{}", path);
                }
            }
            Command::AddVhost { path } => {
                let data = self.request(Method::POST, &path, "vhost").await?;
                if let Some(vhost) = maybe_vhost(&data) {
                    println!("{}\n{}", vhost.path, vhost.access_token);
                }
            }
            Command::ShowVhost { path } => {
                let data = self.request(Method::GET, &path, "vhost").await?;
                if let Some(vhost) = maybe_vhost(&data) {
                    println!("{}\n{}", vhost.path, vhost.access_token);
                }
            }
            Command::DeleteVhost { path } => {
                self.request(Method::DELETE, &path, "").await?;
            }
            Command::ClearVhosts => {
                self.request(Method::DELETE, "/", "").await?;
            }
            Command::RegenerateVhostToken { path } => {
                let data = self.request(Method::PUT, &format!("{}/token", path), "vhost").await?;
                if let Some(vhost) = maybe_vhost(&data) {
                    println!("{}", vhost.access_token);
                }
            }
            Command::ListChannels { vhost } => {
                let data = self
                    .request(Method::GET, &format!("{}/channels", vhost), "channels")
                    .await?;
                let entries = data.as_array().ok_or("couldn't list channels, invalid response")?;
                let mut channels: Vec<ChannelInfo> =
                    entries.iter().filter_map(maybe_channel).collect();
                channels.sort_by(|a, b| a.name.cmp(&b.name));
                for channel in channels {
                    println!("{}\t({} subscribers)", channel.name, channel.subscribers_size);
                }
            }
            Command::AddChannel { vhost, name } => {
                self.request(
                    Method::POST,
                    &format!("{}/channels/{}", vhost, name),
                    "channel",
                )
                .await?;
            }
            Command::DeleteChannel { vhost, name } => {
                self.request(Method::DELETE, &format!("{}/channels/{}", vhost, name), "")
                    .await?;
            }
            Command::ClearChannels { vhost } => {
                self.request(Method::DELETE, &format!("{}/channels", vhost), "")
                    .await?;
            }
            Command::ListWorkers { vhost } => {
                let data = self
                    .request(Method::GET, &format!("{}/workers", vhost), "workers")
                    .await?;
                let entries = data.as_array().ok_or("couldn't list workers, invalid response")?;
                let mut ids: Vec<String> = entries.iter().filter_map(maybe_worker).collect();
                ids.sort();
                for id in ids {
                    println!("{}", id);
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Help and version requests are not a misuse.
            if err.use_stderr() {
                eprintln!("{}", err);
                return ExitCode::FAILURE;
            }
            print!("{}", err);
            return ExitCode::SUCCESS;
        }
    };

    let node = args.node.clone().unwrap_or_else(default_node_name);
    let cookie = match args
        .cookie
        .clone()
        .or_else(|| read_cookie(&args.storage_dir, &node))
    {
        Some(cookie) => cookie,
        None => {
            eprintln!("ERR: no cookie given and none found for node {}", node);
            return ExitCode::FAILURE;
        }
    };

    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            eprintln!("ERR: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let admin = Admin {
        base: args.admin_addr.clone(),
        cookie,
        client,
    };
    match admin.run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("ERR: {}", message);
            ExitCode::FAILURE
        }
    }
}
