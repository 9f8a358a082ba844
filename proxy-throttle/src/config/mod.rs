mod parse;
mod toml;

pub(crate) use self::{
  parse::{Opts, parse_opts},
  toml::ConfigToml,
};
