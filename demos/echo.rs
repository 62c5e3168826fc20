use sprocket::{body, AppError, Interface, Request, ResponseBody, Server, StartResponse};
use std::io::Read;

fn echo(
    req: &mut Request<'_>,
    start_response: &StartResponse,
) -> Result<Box<dyn ResponseBody>, AppError> {
    let content_type = req
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut chunks = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = req.body().read(&mut buf)?;
        if read == 0 {
            break;
        }
        chunks.push(buf[..read].to_vec());
    }

    let path = req.path().to_string();
    log::debug!("echoing {} chunks for {path}", chunks.len());

    start_response.start("200 OK", [("Content-Type", content_type)])?;
    Ok(body::on_close(body::chunks(chunks), move || {
        log::trace!("done with {path}")
    }))
}

fn main() -> std::io::Result<()> {
    pretty_env_logger::init();

    let mut server = Server::builder()
        .interface(Interface::plain("127.0.0.1:8080".parse().unwrap()))
        .app(echo)
        .build();

    println!("Try: curl -T Cargo.toml http://127.0.0.1:8080/echo");
    server.run()
}
