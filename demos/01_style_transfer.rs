use style_transfer as st;

fn main() -> Result<(), st::Error> {
    // create a new session
    let session = st::Session::builder()
        // load the image whose structure we want to keep
        .content(&"imgs/tom.jpg")
        // load the image whose texture statistics we want to adopt
        .style(&"imgs/multiexample/4.jpg")
        // both inputs must share one size, so resize them on load
        .resize_input(st::Dims::square(300))
        // push harder toward the style statistics than the default does
        .style_weight(5000.0)
        .max_iterations(300)
        .build()?;

    // optimize an image that applies the style to "tom.jpg"
    let stylized = session.run(None)?;

    // save the result to the disk
    stylized.save("out/01.jpg")
}
