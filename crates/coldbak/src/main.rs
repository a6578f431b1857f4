use miette::Result;

#[tokio::main]
async fn main() -> Result<()> {
	let (args, _guard) = coldbak::args()?;
	coldbak::run(args).await
}
