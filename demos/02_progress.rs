use style_transfer as st;

fn main() -> Result<(), st::Error> {
    let session = st::Session::builder()
        .content(&"imgs/tom.jpg")
        .style(&"imgs/multiexample/1.jpg")
        .resize_input(st::Dims::square(256))
        .max_iterations(500)
        // emit a progress event every 25 iterations
        .report_interval(25)
        .build()?;

    // watch the loss fall and keep intermediate snapshots around
    let stylized = session.run(Some(Box::new(|info: st::ProgressUpdate<'_>| {
        println!(
            "iteration {:>4} total {:>12.2} content {:>10.4} style {:>10.6} ({:.1?})",
            info.iteration, info.total_loss, info.content_loss, info.style_loss, info.elapsed
        );
        let path = format!("out/02_iter_{:04}.png", info.iteration);
        if let Err(err) = info.image.save(&path) {
            eprintln!("failed to save {}: {}", path, err);
        }
    })))?;

    println!(
        "stopped after {} iterations ({:?})",
        stylized.iterations(),
        stylized.stop_reason()
    );
    stylized.save("out/02.jpg")
}
