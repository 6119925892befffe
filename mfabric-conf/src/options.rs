use structopt::StructOpt;

use mfabric_utils::Bytesize;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "mfabric", about = "IoT message fabric")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Node id
    #[structopt(name = "id", long)]
    pub node_id: Option<u64>,

    /// Bridges launched at startup, --plugins-default-startups mfabric-bridge-lora
    #[structopt(name = "plugins-default-startups", long)]
    pub plugins_default_startups: Option<Vec<String>>,

    /// Maximum accepted payload size, e.g. 256K
    #[structopt(name = "max-payload", long, parse(from_str = Bytesize::from))]
    pub max_payload: Option<Bytesize>,
}
