use async_kindmux::{MuxBuilder, MuxResult};
use tokio::net::{TcpListener, TcpStream};

const ECHO: u64 = 1;
const MAX_MSG_SIZE: u64 = 1024;
const WINDOW: u64 = 16;

async fn echo_server(listener: TcpListener) -> MuxResult<()> {
    let (stream, _) = listener.accept().await?;
    let (mux, worker) = MuxBuilder::new()
        .with_kind(ECHO, 0, 128)
        .with_connection(stream)
        .build()?;
    tokio::spawn(worker);
    loop {
        let mux_stream = mux.accept(ECHO, MAX_MSG_SIZE, WINDOW).await?;
        tokio::spawn(async move {
            while let Ok(msg) = mux_stream.recv(true).await {
                if mux_stream.send(msg).await.is_err() {
                    break;
                }
            }
        });
    }
}

fn init() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[tokio::main]
async fn main() -> MuxResult<()> {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(echo_server(listener));

    let stream = TcpStream::connect(addr).await?;
    let (mux, worker) = MuxBuilder::new()
        .with_kind(ECHO, 128, 0)
        .with_connection(stream)
        .build()?;
    tokio::spawn(worker);
    for i in 0..100 {
        let mux_stream = mux.connect(ECHO, MAX_MSG_SIZE, WINDOW).await?;
        let payload = format!("hello {}", i);
        mux_stream.send(payload.into_bytes()).await?;
        let reply = mux_stream.recv(true).await?;
        println!("{}: {}", i, String::from_utf8_lossy(&reply));
    }
    Ok(())
}
