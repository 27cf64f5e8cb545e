use style_transfer as st;

fn main() -> Result<(), st::Error> {
    // a small hand-built backbone: cheaper than the full VGG-19 table and
    // good enough to show texture statistics being matched
    let backbone = st::ConvNet::from_layers(vec![
        ("conv1".to_string(), st::LayerOp::Conv(st::Conv2d::seeded(32, 3, 17))),
        ("relu1".to_string(), st::LayerOp::Relu),
        ("pool1".to_string(), st::LayerOp::AvgPool),
        ("conv2".to_string(), st::LayerOp::Conv(st::Conv2d::seeded(64, 32, 18))),
        ("relu2".to_string(), st::LayerOp::Relu),
    ]);

    let session = st::Session::builder()
        .content(&"imgs/tom.jpg")
        .style(&"imgs/multiexample/2.jpg")
        .resize_input(st::Dims::square(256))
        .backbone(Box::new(backbone))
        // the layer defaults target the VGG-19 table, so pick our own
        .content_layer("relu2", 1.0)
        .style_layer("relu1", 0.5)
        .style_layer("relu2", 0.5)
        // start from seeded noise instead of the content image
        .noise_init(211)
        .max_iterations(400)
        .build()?;

    let stylized = session.run(None)?;
    stylized.save("out/03.jpg")
}
