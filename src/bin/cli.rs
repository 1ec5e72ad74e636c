//! EmberKV CLI Client
//!
//! Command-line interface for interacting with EmberKV.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::process;

use clap::{Parser, Subcommand};
use emberkv::protocol::{self, to_cmd_line, CmdLine, Reply};

/// EmberKV CLI
#[derive(Parser, Debug)]
#[command(name = "emberkv-cli")]
#[command(about = "CLI for the EmberKV key-value store")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:6399")]
    server: String,

    /// Database to SELECT before the command
    #[arg(short = 'n', long, default_value = "0")]
    db: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete keys
    Del {
        /// The keys to delete
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Ping the server
    Ping,

    /// Compact the append-only file in the background
    Bgrewriteaof,

    /// Send an arbitrary command
    Raw {
        /// Command name followed by its arguments
        #[arg(required = true)]
        args: Vec<String>,
    },
}

impl Commands {
    fn into_cmd_line(self) -> CmdLine {
        match self {
            Commands::Get { key } => to_cmd_line(&["GET", key.as_str()]),
            Commands::Set { key, value } => to_cmd_line(&["SET", key.as_str(), value.as_str()]),
            Commands::Del { keys } => {
                let mut args = vec![b"DEL".to_vec()];
                args.extend(keys.into_iter().map(String::into_bytes));
                args
            }
            Commands::Ping => to_cmd_line(&["PING"]),
            Commands::Bgrewriteaof => to_cmd_line(&["BGREWRITEAOF"]),
            Commands::Raw { args } => args.into_iter().map(String::into_bytes).collect(),
        }
    }
}

fn main() {
    let args = Args::parse();

    let stream = match TcpStream::connect(&args.server) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Could not connect to {}: {}", args.server, e);
            process::exit(1);
        }
    };

    match run(stream, args.db, args.command.into_cmd_line()) {
        Ok(reply) => {
            let failed = reply.is_error();
            print_reply(&reply, 0);
            if failed {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(stream: TcpStream, db: usize, command: CmdLine) -> emberkv::Result<Reply> {
    let mut writer = BufWriter::new(stream.try_clone()?);
    let mut replies = protocol::Parser::new(BufReader::new(stream));

    if db != 0 {
        protocol::write_command(&mut writer, &to_cmd_line(&["SELECT".to_string(), db.to_string()]))?;
        let reply = next_reply(&mut replies)?;
        if reply.is_error() {
            return Ok(reply);
        }
    }

    protocol::write_command(&mut writer, &command)?;
    next_reply(&mut replies)
}

fn next_reply(replies: &mut protocol::Parser<BufReader<TcpStream>>) -> emberkv::Result<Reply> {
    replies.next().unwrap_or_else(|| {
        Err(emberkv::EmberError::Network(
            "server closed the connection".to_string(),
        ))
    })
}

fn print_reply(reply: &Reply, depth: usize) {
    let indent = "  ".repeat(depth);
    match reply {
        Reply::Bulk(Some(value)) => println!("{}\"{}\"", indent, String::from_utf8_lossy(value)),
        Reply::Bulk(None) => println!("{}(nil)", indent),
        Reply::Status(text) => println!("{}{}", indent, text),
        Reply::Integer(value) => println!("{}(integer) {}", indent, value),
        Reply::Error(message) => println!("{}(error) {}", indent, message),
        Reply::MultiBulk(items) if items.is_empty() => println!("{}(empty array)", indent),
        Reply::MultiBulk(items) => {
            for (i, item) in items.iter().enumerate() {
                match item {
                    Some(value) => {
                        println!("{}{}) \"{}\"", indent, i + 1, String::from_utf8_lossy(value))
                    }
                    None => println!("{}{}) (nil)", indent, i + 1),
                }
            }
        }
        Reply::MultiRaw(items) => {
            for item in items {
                print_reply(item, depth + 1);
            }
        }
        Reply::NoReply => {}
    }
}
