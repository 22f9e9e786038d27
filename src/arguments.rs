use {
    super::*,
    clap::builder::styling::{AnsiColor, Effects, Styles},
};

#[derive(Debug, Parser)]
#[command(
  version,
  about = "Bridge browser WebSocket miners onto Stratum pool connections",
  styles = Styles::styled()
    .error(AnsiColor::Red.on_default() | Effects::BOLD)
    .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .invalid(AnsiColor::Red.on_default())
    .literal(AnsiColor::Blue.on_default())
    .placeholder(AnsiColor::Cyan.on_default())
    .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .valid(AnsiColor::Green.on_default()),
)]
pub(crate) struct Arguments {
    #[command(flatten)]
    pub(crate) options: Options,
}

impl Arguments {
    pub(crate) fn run(self) -> Result {
        let settings = Arc::new(Settings::from_options(self.options)?);

        Runtime::new()?.block_on(async {
            let proxy = Proxy::new(settings);

            let (address, mut server) = proxy.listen().await?;

            info!("Proxying WebSocket miners on {address}");

            tokio::select! {
                _ = ctrl_c() => {
                    info!("Received shutdown signal, stopping proxy...");
                    proxy.kill();
                    let _ = (&mut server).await;
                }
                result = &mut server => {
                    result.context("HTTP server task panicked")??;
                }
            }

            Ok(())
        })
    }
}
