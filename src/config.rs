use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    pub connection: Connection,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Connection {
    /// connect 报文最迟到达时间（毫秒），超时则会话以错误关闭
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 会话命令通道容量
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_channel_capacity() -> usize {
    1000
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    pub async fn from_path(path: &str) -> Self {
        let mut file = fs::File::open(path).await.unwrap();
        let mut s = String::new();
        file.read_to_string(&mut s).await.unwrap();

        toml::from_str::<Config>(&s).unwrap()
    }
}
