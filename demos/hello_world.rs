use sprocket::{body, AppError, Interface, Request, ResponseBody, Server, StartResponse};

fn hello(
    _: &mut Request<'_>,
    start_response: &StartResponse,
) -> Result<Box<dyn ResponseBody>, AppError> {
    start_response.start("200 OK", [("Content-Type", "text/plain")])?;
    Ok(body::full("Hello, world!"))
}

fn main() -> std::io::Result<()> {
    pretty_env_logger::init();

    Server::builder()
        .interface(Interface::plain("127.0.0.1:8080".parse().unwrap()))
        .app(hello)
        .build()
        .run()
}
